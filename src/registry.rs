use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// An agent as seen by the engine: a capability tag-set plus the model it
/// talks to. The full agent record (instructions, skills prose, avatar)
/// lives outside the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default = "AgentProfile::default_model")]
    pub model: String,
}

impl AgentProfile {
    fn default_model() -> String {
        "gpt-4o-mini".to_string()
    }

    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tags: BTreeSet::new(),
            model: Self::default_model(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = normalize_tags(tags);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

/// An MCP server as seen by the engine: a capability tag-set and the tools
/// it exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub description: String,
}

impl ServerProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tags: BTreeSet::new(),
            tools: Vec::new(),
            description: String::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = normalize_tags(tags);
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Capability tags are compared case-insensitively everywhere; lower-case
/// them once on the way in.
pub fn normalize_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    tags.into_iter()
        .map(|t| t.into().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("agent `{0}` not found")]
    AgentNotFound(String),
    #[error("MCP server `{0}` not found")]
    ServerNotFound(String),
    #[error("catalog error: {0}")]
    Catalog(String),
}

/// Read side of the agent/server catalog the engine depends on.
pub trait CapabilityRegistry: Send + Sync {
    fn get_agent(&self, id: &str) -> Result<AgentProfile, RegistryError>;
    fn get_server(&self, id: &str) -> Result<ServerProfile, RegistryError>;
    fn list_agents(&self) -> Vec<AgentProfile>;
    fn list_servers(&self) -> Vec<ServerProfile>;
}

/// JSON catalog file shape: `{ "agents": [...], "servers": [...] }`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
    #[serde(default)]
    pub servers: Vec<ServerProfile>,
}

#[derive(Debug, Default)]
pub struct InMemoryCapabilityRegistry {
    agents: DashMap<String, AgentProfile>,
    servers: DashMap<String, ServerProfile>,
}

impl InMemoryCapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_agent(&self, mut agent: AgentProfile) {
        agent.tags = normalize_tags(agent.tags);
        info!("Registered agent: {} ({})", agent.name, agent.id);
        self.agents.insert(agent.id.clone(), agent);
    }

    pub fn register_server(&self, mut server: ServerProfile) {
        server.tags = normalize_tags(server.tags);
        info!("Registered MCP server: {} ({})", server.name, server.id);
        self.servers.insert(server.id.clone(), server);
    }

    pub fn load_catalog_file(&self, path: &Path) -> Result<(), RegistryError> {
        let json = fs::read_to_string(path)
            .map_err(|e| RegistryError::Catalog(format!("read error: {}", e)))?;
        let catalog: Catalog = serde_json::from_str(&json)
            .map_err(|e| RegistryError::Catalog(format!("parse error: {}", e)))?;
        for agent in catalog.agents {
            self.register_agent(agent);
        }
        for server in catalog.servers {
            self.register_server(server);
        }
        Ok(())
    }
}

impl CapabilityRegistry for InMemoryCapabilityRegistry {
    fn get_agent(&self, id: &str) -> Result<AgentProfile, RegistryError> {
        self.agents
            .get(id)
            .map(|a| a.clone())
            .ok_or_else(|| RegistryError::AgentNotFound(id.to_string()))
    }

    fn get_server(&self, id: &str) -> Result<ServerProfile, RegistryError> {
        self.servers
            .get(id)
            .map(|s| s.clone())
            .ok_or_else(|| RegistryError::ServerNotFound(id.to_string()))
    }

    fn list_agents(&self) -> Vec<AgentProfile> {
        self.agents.iter().map(|e| e.value().clone()).collect()
    }

    fn list_servers(&self) -> Vec<ServerProfile> {
        self.servers.iter().map(|e| e.value().clone()).collect()
    }
}
