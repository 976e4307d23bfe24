use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("provider error: {0}")]
    Provider(String),
    #[error("completion timed out")]
    Timeout,
}

/// The LLM collaborator consumed by agent-call nodes: one prompt in, one
/// completion string out.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<String, GatewayError>;
}

/// Gateway speaking the OpenAI chat-completions dialect. Any provider with
/// a compatible endpoint works by pointing `base_url` at it.
#[derive(Debug, Clone)]
pub struct OpenAiGateway {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiGateway {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl LlmGateway for OpenAiGateway {
    #[tracing::instrument(name = "llm_complete", skip(self, prompt))]
    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<String, GatewayError> {
        let body = json!({
            "model": model,
            "messages": [
                {"role": "user", "content": prompt},
            ],
        });

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let request = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let resp = tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| GatewayError::Timeout)?
            .map_err(|e| GatewayError::Provider(format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_else(|_| "<no body>".into());
            error!("LLM provider error: {}", text);
            return Err(GatewayError::Provider(format!(
                "provider returned error: {}",
                text
            )));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Provider(format!("invalid response: {e}")))?;

        let content = json
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                GatewayError::Provider("response missing message content".to_string())
            })?;

        Ok(content.to_string())
    }
}
