use async_trait::async_trait;
use dashmap::DashMap;

use crate::execution::ExecutionRecord;
use crate::pipeline::PipelineDefinition;

/// Persistence seam for pipeline definitions. Storage technology is the
/// caller's concern; the engine only needs these four operations.
#[async_trait]
pub trait PipelineRepository: Send + Sync {
    async fn save(&self, def: PipelineDefinition);
    async fn get(&self, id: &str) -> Option<PipelineDefinition>;
    async fn list(&self) -> Vec<PipelineDefinition>;
    async fn delete(&self, id: &str);
}

/// Persistence seam for execution records. Records are append-only
/// history: saved once on completion, then only read.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn save(&self, record: ExecutionRecord);
    async fn get(&self, id: &str) -> Option<ExecutionRecord>;
    async fn list(&self) -> Vec<ExecutionRecord>;
    async fn delete(&self, id: &str);
}

#[derive(Debug, Default)]
pub struct InMemoryPipelineRepository {
    pipelines: DashMap<String, PipelineDefinition>,
}

impl InMemoryPipelineRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineRepository for InMemoryPipelineRepository {
    async fn save(&self, def: PipelineDefinition) {
        self.pipelines.insert(def.id(), def);
    }

    async fn get(&self, id: &str) -> Option<PipelineDefinition> {
        self.pipelines.get(id).map(|d| d.clone())
    }

    async fn list(&self) -> Vec<PipelineDefinition> {
        self.pipelines.iter().map(|d| d.clone()).collect()
    }

    async fn delete(&self, id: &str) {
        self.pipelines.remove(id);
    }
}

#[derive(Debug, Default)]
pub struct InMemoryExecutionRepository {
    executions: DashMap<String, ExecutionRecord>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn save(&self, record: ExecutionRecord) {
        self.executions.insert(record.id.clone(), record);
    }

    async fn get(&self, id: &str) -> Option<ExecutionRecord> {
        self.executions.get(id).map(|r| r.clone())
    }

    async fn list(&self) -> Vec<ExecutionRecord> {
        self.executions.iter().map(|r| r.clone()).collect()
    }

    async fn delete(&self, id: &str) {
        self.executions.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{NodeConfig, NodeKind};

    #[tokio::test]
    async fn test_pipeline_repository_crud() {
        let repo = InMemoryPipelineRepository::new();
        let mut def = PipelineDefinition::new("p1", "demo", "");
        def.add_node(NodeConfig::new("in", NodeKind::Input));
        repo.save(def.build()).await;

        assert!(repo.get("p1").await.is_some());
        assert_eq!(repo.list().await.len(), 1);

        repo.delete("p1").await;
        assert!(repo.get("p1").await.is_none());
    }
}
