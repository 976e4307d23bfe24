use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::compat::{self, CompatibilityLevel, CompatibilityReport};
use crate::mcp::McpClient;
use crate::registry::{CapabilityRegistry, RegistryError, ServerProfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouplingState {
    Created,
    Tested,
    Active,
    Inactive,
}

/// A registered pairing between an agent and an MCP server, gated by
/// compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coupling {
    pub id: String,
    pub agent_id: String,
    pub server_id: String,
    pub score: f64,
    pub level: CompatibilityLevel,
    pub state: CouplingState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub ok: bool,
    pub tool_count: usize,
    pub message: String,
}

/// Summary over every registered coupling, in the shape the original
/// operator tooling reported: totals plus per-level and per-server counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouplingReport {
    pub total: usize,
    pub active: usize,
    pub by_level: BTreeMap<String, usize>,
    pub server_usage: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Error)]
pub enum CouplingError {
    #[error("coupling `{0}` not found")]
    NotFound(String),
    #[error("an active coupling already exists for ({agent_id}, {server_id})")]
    Conflict { agent_id: String, server_id: String },
    #[error("cannot {operation} a coupling in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: CouplingState,
    },
    #[error("agent and server capabilities do not overlap")]
    Incompatible,
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Registry of agent/server couplings. This is the one piece of state
/// shared across concurrent pipeline runs; create and activate are
/// serialized per (agent_id, server_id) key so the "at most one Active
/// coupling per pair" invariant holds under concurrent requests.
pub struct CouplingRegistry {
    registry: Arc<dyn CapabilityRegistry>,
    mcp: Arc<dyn McpClient>,
    couplings: DashMap<String, Coupling>,
    pair_locks: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl CouplingRegistry {
    pub fn new(registry: Arc<dyn CapabilityRegistry>, mcp: Arc<dyn McpClient>) -> Self {
        Self {
            registry,
            mcp,
            couplings: DashMap::new(),
            pair_locks: DashMap::new(),
        }
    }

    fn pair_lock(&self, agent_id: &str, server_id: &str) -> Arc<Mutex<()>> {
        self.pair_locks
            .entry((agent_id.to_string(), server_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn active_exists(&self, agent_id: &str, server_id: &str) -> bool {
        self.couplings.iter().any(|c| {
            c.agent_id == agent_id && c.server_id == server_id && c.state == CouplingState::Active
        })
    }

    /// Register a new coupling in state `Created`. Rejected when the pair
    /// already has an Active coupling, or when the analyzer finds the pair
    /// incompatible and the caller did not override that policy.
    pub async fn create(
        &self,
        agent_id: &str,
        server_id: &str,
        allow_incompatible: bool,
    ) -> Result<Coupling, CouplingError> {
        let agent = self.registry.get_agent(agent_id)?;
        let server = self.registry.get_server(server_id)?;

        let report = compat::analyze(&agent, &server);
        if report.level == CompatibilityLevel::Incompatible && !allow_incompatible {
            return Err(CouplingError::Incompatible);
        }

        let lock = self.pair_lock(agent_id, server_id);
        let _guard = lock.lock().await;

        if self.active_exists(agent_id, server_id) {
            return Err(CouplingError::Conflict {
                agent_id: agent_id.to_string(),
                server_id: server_id.to_string(),
            });
        }

        let coupling = Coupling {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            server_id: server_id.to_string(),
            score: report.score,
            level: report.level,
            state: CouplingState::Created,
            created_at: Utc::now(),
        };
        self.couplings
            .insert(coupling.id.clone(), coupling.clone());

        info!(
            "Created coupling: {} <-> {} ({:?})",
            agent.name, server.name, report.level
        );
        Ok(coupling)
    }

    /// Probe the server through the MCP client. A successful probe moves
    /// the coupling to `Tested`; a failed one leaves the state untouched
    /// and reports the failure in the result.
    pub async fn test(&self, coupling_id: &str) -> Result<TestResult, CouplingError> {
        let (server_id, state) = {
            let coupling = self
                .couplings
                .get(coupling_id)
                .ok_or_else(|| CouplingError::NotFound(coupling_id.to_string()))?;
            (coupling.server_id.clone(), coupling.state)
        };

        if matches!(state, CouplingState::Active | CouplingState::Inactive) {
            return Err(CouplingError::InvalidState {
                operation: "test",
                state,
            });
        }

        match self.mcp.list_tools(&server_id).await {
            Ok(tools) => {
                if let Some(mut coupling) = self.couplings.get_mut(coupling_id) {
                    coupling.state = CouplingState::Tested;
                }
                Ok(TestResult {
                    ok: true,
                    tool_count: tools.len(),
                    message: format!("server exposed {} tools", tools.len()),
                })
            }
            Err(e) => Ok(TestResult {
                ok: false,
                tool_count: 0,
                message: e.to_string(),
            }),
        }
    }

    /// Move a Tested coupling to Active. The Active-uniqueness check runs
    /// under the same pair lock as `create`: two Created couplings for one
    /// pair can both pass testing, but only one of them can activate.
    pub async fn activate(&self, coupling_id: &str) -> Result<Coupling, CouplingError> {
        let (agent_id, server_id, state) = {
            let coupling = self
                .couplings
                .get(coupling_id)
                .ok_or_else(|| CouplingError::NotFound(coupling_id.to_string()))?;
            (
                coupling.agent_id.clone(),
                coupling.server_id.clone(),
                coupling.state,
            )
        };

        if state != CouplingState::Tested {
            return Err(CouplingError::InvalidState {
                operation: "activate",
                state,
            });
        }

        let lock = self.pair_lock(&agent_id, &server_id);
        let _guard = lock.lock().await;

        if self.active_exists(&agent_id, &server_id) {
            return Err(CouplingError::Conflict {
                agent_id,
                server_id,
            });
        }

        let mut coupling = self
            .couplings
            .get_mut(coupling_id)
            .ok_or_else(|| CouplingError::NotFound(coupling_id.to_string()))?;
        coupling.state = CouplingState::Active;
        info!("Activated coupling: {} <-> {}", agent_id, server_id);
        Ok(coupling.clone())
    }

    /// Move an Active coupling to Inactive.
    pub fn disconnect(&self, coupling_id: &str) -> Result<(), CouplingError> {
        let mut coupling = self
            .couplings
            .get_mut(coupling_id)
            .ok_or_else(|| CouplingError::NotFound(coupling_id.to_string()))?;
        if coupling.state != CouplingState::Active {
            return Err(CouplingError::InvalidState {
                operation: "disconnect",
                state: coupling.state,
            });
        }
        coupling.state = CouplingState::Inactive;
        info!(
            "Disconnected coupling: {} <-> {}",
            coupling.agent_id, coupling.server_id
        );
        Ok(())
    }

    pub fn get(&self, coupling_id: &str) -> Option<Coupling> {
        self.couplings.get(coupling_id).map(|c| c.clone())
    }

    pub fn list(&self) -> Vec<Coupling> {
        self.couplings.iter().map(|c| c.clone()).collect()
    }

    /// Whether `server_id` has an Active coupling usable by the given
    /// agent context. An empty context means the pipeline declares no
    /// agents; any Active coupling for the server then qualifies.
    pub fn is_server_active_for(&self, server_id: &str, agents: &[String]) -> bool {
        self.couplings.iter().any(|c| {
            c.server_id == server_id
                && c.state == CouplingState::Active
                && (agents.is_empty() || agents.contains(&c.agent_id))
        })
    }

    /// Rank every registered server against one agent, best first.
    pub fn compatible_servers(
        &self,
        agent_id: &str,
        min_level: CompatibilityLevel,
    ) -> Result<Vec<(ServerProfile, CompatibilityReport)>, CouplingError> {
        let agent = self.registry.get_agent(agent_id)?;
        let mut ranked: Vec<(ServerProfile, CompatibilityReport)> = self
            .registry
            .list_servers()
            .into_iter()
            .map(|server| {
                let report = compat::analyze(&agent, &server);
                (server, report)
            })
            .filter(|(_, report)| report.level >= min_level)
            .collect();
        ranked.sort_by(|a, b| {
            b.1.score
                .partial_cmp(&a.1.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(ranked)
    }

    pub fn report(&self) -> CouplingReport {
        let mut by_level: BTreeMap<String, usize> = BTreeMap::new();
        let mut server_usage: BTreeMap<String, usize> = BTreeMap::new();
        let mut active = 0;

        for coupling in self.couplings.iter() {
            *by_level
                .entry(format!("{:?}", coupling.level))
                .or_default() += 1;
            *server_usage.entry(coupling.server_id.clone()).or_default() += 1;
            if coupling.state == CouplingState::Active {
                active += 1;
            }
        }

        CouplingReport {
            total: self.couplings.len(),
            active,
            by_level,
            server_usage,
        }
    }
}
