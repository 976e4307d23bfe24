use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::compat::{self, CompatibilityReport};
use crate::config::EngineConfig;
use crate::coupling::{Coupling, CouplingError, CouplingRegistry, CouplingReport, TestResult};
use crate::execution::ExecutionRecord;
use crate::executor::{ExecuteError, PipelineExecutor};
use crate::gateway::LlmGateway;
use crate::mcp::McpClient;
use crate::pipeline::PipelineDefinition;
use crate::registry::{CapabilityRegistry, RegistryError};
use crate::store::{ExecutionRepository, PipelineRepository};
use crate::validator::{self, ValidationReport};

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("pipeline `{0}` not found")]
    PipelineNotFound(String),
    #[error(transparent)]
    Execute(#[from] ExecuteError),
}

/// The boundary the outer API/CLI layer talks to: validation, execution,
/// execution history, compatibility analysis, and coupling management,
/// wired over injected collaborators.
pub struct Engine {
    registry: Arc<dyn CapabilityRegistry>,
    couplings: Arc<CouplingRegistry>,
    executor: PipelineExecutor,
    pipelines: Arc<dyn PipelineRepository>,
    executions: Arc<dyn ExecutionRepository>,
}

impl Engine {
    pub fn new(
        registry: Arc<dyn CapabilityRegistry>,
        gateway: Arc<dyn LlmGateway>,
        mcp: Arc<dyn McpClient>,
        pipelines: Arc<dyn PipelineRepository>,
        executions: Arc<dyn ExecutionRepository>,
        config: EngineConfig,
    ) -> Self {
        let couplings = Arc::new(CouplingRegistry::new(registry.clone(), mcp.clone()));
        let executor = PipelineExecutor::new(
            registry.clone(),
            gateway,
            mcp,
            couplings.clone(),
            config,
        );
        Self {
            registry,
            couplings,
            executor,
            pipelines,
            executions,
        }
    }

    pub fn registry(&self) -> &dyn CapabilityRegistry {
        self.registry.as_ref()
    }

    pub fn couplings(&self) -> &CouplingRegistry {
        self.couplings.as_ref()
    }

    pub fn validate_pipeline(&self, def: &PipelineDefinition) -> ValidationReport {
        validator::validate(def, self.registry.as_ref())
    }

    /// Run a pipeline and persist the resulting record. Every call
    /// produces a fresh record, also when the run fails.
    pub async fn execute_pipeline(
        &self,
        def: &PipelineDefinition,
        input: Value,
    ) -> Result<ExecutionRecord, ExecuteError> {
        let record = self.executor.execute(def, input).await?;
        info!(
            "Execution {} finished with status {:?}",
            record.id, record.status
        );
        self.executions.save(record.clone()).await;
        Ok(record)
    }

    pub async fn execute_pipeline_by_id(
        &self,
        pipeline_id: &str,
        input: Value,
    ) -> Result<ExecutionRecord, EngineError> {
        let def = self
            .pipelines
            .get(pipeline_id)
            .await
            .ok_or_else(|| EngineError::PipelineNotFound(pipeline_id.to_string()))?;
        Ok(self.execute_pipeline(&def, input).await?)
    }

    pub fn cancel_execution(&self, execution_id: &str) -> bool {
        self.executor.cancel(execution_id)
    }

    pub fn active_executions(&self) -> Vec<String> {
        self.executor.active_executions()
    }

    pub async fn get_execution(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.executions.get(execution_id).await
    }

    pub async fn list_executions(&self) -> Vec<ExecutionRecord> {
        self.executions.list().await
    }

    pub fn analyze_compatibility(
        &self,
        agent_id: &str,
        server_id: &str,
    ) -> Result<CompatibilityReport, RegistryError> {
        let agent = self.registry.get_agent(agent_id)?;
        let server = self.registry.get_server(server_id)?;
        Ok(compat::analyze(&agent, &server))
    }

    pub async fn create_coupling(
        &self,
        agent_id: &str,
        server_id: &str,
        allow_incompatible: bool,
    ) -> Result<Coupling, CouplingError> {
        self.couplings
            .create(agent_id, server_id, allow_incompatible)
            .await
    }

    pub async fn test_coupling(&self, coupling_id: &str) -> Result<TestResult, CouplingError> {
        self.couplings.test(coupling_id).await
    }

    pub async fn activate_coupling(&self, coupling_id: &str) -> Result<Coupling, CouplingError> {
        self.couplings.activate(coupling_id).await
    }

    pub fn disconnect_coupling(&self, coupling_id: &str) -> Result<(), CouplingError> {
        self.couplings.disconnect(coupling_id)
    }

    pub fn coupling_report(&self) -> CouplingReport {
        self.couplings.report()
    }

    pub async fn save_pipeline(&self, def: PipelineDefinition) {
        self.pipelines.save(def).await;
    }

    pub async fn get_pipeline(&self, id: &str) -> Option<PipelineDefinition> {
        self.pipelines.get(id).await
    }

    pub async fn list_pipelines(&self) -> Vec<PipelineDefinition> {
        self.pipelines.list().await
    }

    pub async fn delete_pipeline(&self, id: &str) {
        self.pipelines.delete(id).await;
    }
}
