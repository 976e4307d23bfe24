use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum McpError {
    #[error("tool error: {0}")]
    Tool(String),
    #[error("tool call timed out")]
    Timeout,
}

/// The MCP collaborator contract. Only the call surface is modelled here;
/// transport and wire format live outside the core.
#[async_trait]
pub trait McpClient: Send + Sync {
    async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        params: Value,
    ) -> Result<Value, McpError>;

    /// Cheap liveness probe used when testing a coupling.
    async fn list_tools(&self, server_id: &str) -> Result<Vec<String>, McpError>;
}

/// Client for deployments without any MCP transport wired in: every call
/// fails, which surfaces as a tool error on the node that needed it.
#[derive(Debug, Default, Clone)]
pub struct NullMcpClient;

#[async_trait]
impl McpClient for NullMcpClient {
    async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        _params: Value,
    ) -> Result<Value, McpError> {
        Err(McpError::Tool(format!(
            "no MCP client configured for {server_id}.{tool_name}"
        )))
    }

    async fn list_tools(&self, server_id: &str) -> Result<Vec<String>, McpError> {
        Err(McpError::Tool(format!(
            "no MCP client configured for {server_id}"
        )))
    }
}
