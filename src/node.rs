use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::coupling::CouplingRegistry;
use crate::gateway::{GatewayError, LlmGateway};
use crate::mcp::{McpClient, McpError};
use crate::message::Message;
use crate::pipeline::{NodeKind, TextOperation};
use crate::registry::CapabilityRegistry;

/// Failure kind for calls that leave the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorKind {
    Timeout,
    ProviderError,
    ToolError,
    Cancelled,
}

/// Node-level failure. External failures never crash the run; the
/// scheduler records them and degrades the affected branch.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum NodeError {
    #[error("external call failed ({kind:?}): {message}")]
    External { kind: CallErrorKind, message: String },
    #[error("internal error: {0}")]
    Internal(String),
}

impl NodeError {
    pub fn timeout(message: impl Into<String>) -> Self {
        NodeError::External {
            kind: CallErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn provider(message: impl Into<String>) -> Self {
        NodeError::External {
            kind: CallErrorKind::ProviderError,
            message: message.into(),
        }
    }

    pub fn tool(message: impl Into<String>) -> Self {
        NodeError::External {
            kind: CallErrorKind::ToolError,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        NodeError::External {
            kind: CallErrorKind::Cancelled,
            message: "run was cancelled".to_string(),
        }
    }

    pub fn kind(&self) -> Option<CallErrorKind> {
        match self {
            NodeError::External { kind, .. } => Some(*kind),
            NodeError::Internal(_) => None,
        }
    }
}

/// Everything a node needs at execution time. One context is built per run
/// and shared by all of that run's node tasks.
#[derive(Clone)]
pub struct NodeContext {
    registry: Arc<dyn CapabilityRegistry>,
    gateway: Arc<dyn LlmGateway>,
    mcp: Arc<dyn McpClient>,
    couplings: Arc<CouplingRegistry>,
    agent_context: Vec<String>,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl NodeContext {
    pub fn new(
        registry: Arc<dyn CapabilityRegistry>,
        gateway: Arc<dyn LlmGateway>,
        mcp: Arc<dyn McpClient>,
        couplings: Arc<CouplingRegistry>,
        agent_context: Vec<String>,
        call_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            gateway,
            mcp,
            couplings,
            agent_context,
            call_timeout,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Dispatch by kind. The match is exhaustive: a new node kind does not
    /// compile until it has an executor arm.
    pub async fn run(&self, kind: &NodeKind, input: Message) -> Result<Message, NodeError> {
        match kind {
            NodeKind::Input => Ok(input),
            NodeKind::Output => Ok(input),
            NodeKind::TextTransform { operation } => Ok(apply_transform(*operation, &input)),
            NodeKind::AgentCall { agent_id } => self.run_agent_call(agent_id, input).await,
            NodeKind::McpToolCall {
                server_id,
                tool_name,
            } => self.run_mcp_tool_call(server_id, tool_name, input).await,
        }
    }

    #[tracing::instrument(name = "agent_call_node", skip(self, input))]
    async fn run_agent_call(&self, agent_id: &str, input: Message) -> Result<Message, NodeError> {
        let agent = self
            .registry
            .get_agent(agent_id)
            .map_err(|e| NodeError::Internal(e.to_string()))?;

        let prompt = input.payload_text();
        let completion = tokio::select! {
            _ = self.cancel.cancelled() => return Err(NodeError::cancelled()),
            res = self.gateway.complete(&prompt, &agent.model, self.call_timeout) => res,
        };

        match completion {
            Ok(text) => {
                let mut out = input.next(Value::String(text));
                out.add("model".to_string(), agent.model.clone());
                Ok(out)
            }
            Err(GatewayError::Timeout) => Err(NodeError::timeout(format!(
                "agent `{}` did not answer within {:?}",
                agent_id, self.call_timeout
            ))),
            Err(GatewayError::Provider(msg)) => Err(NodeError::provider(msg)),
        }
    }

    #[tracing::instrument(name = "mcp_tool_call_node", skip(self, input))]
    async fn run_mcp_tool_call(
        &self,
        server_id: &str,
        tool_name: &str,
        input: Message,
    ) -> Result<Message, NodeError> {
        if !self
            .couplings
            .is_server_active_for(server_id, &self.agent_context)
        {
            return Err(NodeError::tool(format!(
                "no active coupling for server `{}`",
                server_id
            )));
        }

        let call = self.mcp.call_tool(server_id, tool_name, input.payload());
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return Err(NodeError::cancelled()),
            res = tokio::time::timeout(self.call_timeout, call) => res,
        };

        match result {
            Ok(Ok(value)) => {
                let mut out = input.next(value);
                out.add("tool".to_string(), format!("{}.{}", server_id, tool_name));
                Ok(out)
            }
            Ok(Err(McpError::Timeout)) => Err(NodeError::timeout(format!(
                "tool `{}.{}` timed out",
                server_id, tool_name
            ))),
            Ok(Err(McpError::Tool(msg))) => Err(NodeError::tool(msg)),
            Err(_) => Err(NodeError::timeout(format!(
                "tool `{}.{}` did not answer within {:?}",
                server_id, tool_name, self.call_timeout
            ))),
        }
    }
}

/// Deterministic, synchronous text operation. Non-string payloads are
/// rendered to text first, matching how prompts are built.
pub fn apply_transform(operation: TextOperation, input: &Message) -> Message {
    let text = input.payload_text();
    let payload = match operation {
        TextOperation::Uppercase => Value::String(text.to_uppercase()),
        TextOperation::Lowercase => Value::String(text.to_lowercase()),
        TextOperation::Reverse => Value::String(text.chars().rev().collect()),
        TextOperation::WordCount => json!(text.split_whitespace().count()),
    };
    input.next(payload)
}
