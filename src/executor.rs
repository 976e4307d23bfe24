use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use petgraph::Direction;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::coupling::CouplingRegistry;
use crate::execution::{ExecutionRecord, ExecutionStatus, NodeState, NodeStatus};
use crate::gateway::LlmGateway;
use crate::mcp::McpClient;
use crate::message::Message;
use crate::node::{apply_transform, NodeContext, NodeError};
use crate::pipeline::{NodeKind, PipelineDefinition};
use crate::registry::CapabilityRegistry;
use crate::validator;

#[derive(Debug, Clone, Error)]
pub enum ExecuteError {
    #[error("pipeline failed validation: {}", issues.join("; "))]
    Validation { issues: Vec<String> },
}

/// Drives one pipeline run: derives the execution order from the
/// connection graph, dispatches ready nodes with bounded fan-out, and
/// aggregates per-node outcomes into an `ExecutionRecord`.
///
/// Runs are independent of each other; the only state shared between
/// concurrent `execute` calls is the coupling registry and the map of
/// cancellation handles.
pub struct PipelineExecutor {
    registry: Arc<dyn CapabilityRegistry>,
    gateway: Arc<dyn LlmGateway>,
    mcp: Arc<dyn McpClient>,
    couplings: Arc<CouplingRegistry>,
    config: EngineConfig,
    active_runs: DashMap<String, CancellationToken>,
}

impl PipelineExecutor {
    pub fn new(
        registry: Arc<dyn CapabilityRegistry>,
        gateway: Arc<dyn LlmGateway>,
        mcp: Arc<dyn McpClient>,
        couplings: Arc<CouplingRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            gateway,
            mcp,
            couplings,
            config,
            active_runs: DashMap::new(),
        }
    }

    /// Request cooperative cancellation of a running execution. In-flight
    /// external calls abort with kind `Cancelled`; nodes not yet started
    /// are skipped. Returns false when no such run is active.
    pub fn cancel(&self, execution_id: &str) -> bool {
        match self.active_runs.get(execution_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of runs currently in flight.
    pub fn active_executions(&self) -> Vec<String> {
        self.active_runs.iter().map(|e| e.key().clone()).collect()
    }

    /// Execute a validated pipeline against one input. An invalid
    /// definition is rejected before any record is created.
    #[tracing::instrument(name = "pipeline_execute", skip(self, def, input), fields(pipeline = %def.id()))]
    pub async fn execute(
        &self,
        def: &PipelineDefinition,
        input: Value,
    ) -> Result<ExecutionRecord, ExecuteError> {
        let report = validator::validate(def, self.registry.as_ref());
        if !report.valid {
            return Err(ExecuteError::Validation {
                issues: report.issues,
            });
        }

        let mut record =
            ExecutionRecord::started(def.id(), def.version(), input.clone());
        for id in def.nodes().keys() {
            record.node_states.insert(id.clone(), NodeState::pending());
        }

        let cancel = CancellationToken::new();
        self.active_runs.insert(record.id.clone(), cancel.clone());

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let ctx = Arc::new(NodeContext::new(
            self.registry.clone(),
            self.gateway.clone(),
            self.mcp.clone(),
            self.couplings.clone(),
            def.agent_context(),
            self.config.call_timeout,
            cancel.clone(),
        ));

        info!(
            "Executing pipeline {} ({} nodes)",
            def.id(),
            def.nodes().len()
        );

        self.run_dag(def, &mut record, ctx, semaphore, &cancel).await;

        record.finished_at = Some(Utc::now());
        record.output = final_output(def, &record);
        let failed = record
            .node_states
            .values()
            .any(|s| s.status == NodeStatus::Failed);
        // a cancel that lands between settles leaves only skips behind;
        // the run still must not report success
        let cancelled = cancel.is_cancelled()
            && record
                .node_states
                .values()
                .any(|s| s.status != NodeStatus::Succeeded);
        record.status = if failed || cancelled {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Succeeded
        };
        if record.status == ExecutionStatus::Failed {
            record.error =
                first_failure(&record).or_else(|| Some("run was cancelled".to_string()));
        }

        self.active_runs.remove(&record.id);
        Ok(record)
    }

    /// Kahn's algorithm over the declared connections. A node is
    /// dispatched only once every predecessor is terminal; nodes with no
    /// surviving successful predecessor are skipped instead of run.
    async fn run_dag(
        &self,
        def: &PipelineDefinition,
        record: &mut ExecutionRecord,
        ctx: Arc<NodeContext>,
        semaphore: Arc<Semaphore>,
        cancel: &CancellationToken,
    ) {
        let mut in_deg: HashMap<String, usize> = def
            .nodes()
            .keys()
            .map(|id| {
                let degree = def
                    .node_index(id)
                    .map(|idx| def.graph().edges_directed(idx, Direction::Incoming).count())
                    .unwrap_or(0);
                (id.clone(), degree)
            })
            .collect();

        // sorted seed so runs over the same definition dispatch in a
        // stable order
        let mut ready: VecDeque<String> = {
            let mut seed: Vec<String> = in_deg
                .iter()
                .filter(|&(_, &d)| d == 0)
                .map(|(id, _)| id.clone())
                .collect();
            seed.sort();
            seed.into()
        };

        let mut outputs: HashMap<String, Message> = HashMap::new();
        let mut tasks: JoinSet<(String, Result<Message, NodeError>)> = JoinSet::new();

        loop {
            while let Some(id) = ready.pop_front() {
                let node = match def.node(&id) {
                    Some(n) => n,
                    None => continue,
                };

                if cancel.is_cancelled() {
                    self.mark_terminal(record, &id, NodeStatus::Skipped, None, None);
                    release_successors(def, &id, &mut in_deg, &mut ready);
                    continue;
                }

                let preds = def.predecessors(&id);
                let survivors: Vec<&str> = preds
                    .iter()
                    .copied()
                    .filter(|p| record.node_status(p) == Some(NodeStatus::Succeeded))
                    .collect();

                // no path of successes leads here: the node is skipped,
                // and its successors get their chance to decide the same
                if !preds.is_empty() && survivors.is_empty() {
                    self.mark_terminal(record, &id, NodeStatus::Skipped, None, None);
                    release_successors(def, &id, &mut in_deg, &mut ready);
                    continue;
                }

                let input = node_input(&record.id, &record.input, &preds, &survivors, &outputs);

                if node.kind.is_external() {
                    record
                        .node_states
                        .insert(id.clone(), NodeState {
                            status: NodeStatus::Running,
                            output: None,
                            error: None,
                        });
                    let kind = node.kind.clone();
                    let ctx = ctx.clone();
                    let semaphore = semaphore.clone();
                    let node_id = id.clone();
                    tasks.spawn(async move {
                        let permit = tokio::select! {
                            _ = ctx.cancel_token().cancelled() => None,
                            permit = semaphore.acquire_owned() => permit.ok(),
                        };
                        if permit.is_none() {
                            return (node_id, Err(NodeError::cancelled()));
                        }
                        let result = ctx.run(&kind, input).await;
                        (node_id, result)
                    });
                } else {
                    // CPU-bound kinds run inline on the scheduler task
                    let result = match &node.kind {
                        NodeKind::Input | NodeKind::Output => Ok(input),
                        NodeKind::TextTransform { operation } => {
                            Ok(apply_transform(*operation, &input))
                        }
                        // external kinds were dispatched above
                        _ => unreachable!("external node executed inline"),
                    };
                    self.settle(def, record, &id, result, &mut outputs, &mut in_deg, &mut ready);
                }
            }

            match tasks.join_next().await {
                Some(Ok((id, result))) => {
                    self.settle(def, record, &id, result, &mut outputs, &mut in_deg, &mut ready);
                }
                Some(Err(join_err)) => {
                    warn!("node task aborted: {}", join_err);
                    // the node never reached a terminal state; the run
                    // drains below and leftover nodes become Skipped
                }
                None => {
                    if ready.is_empty() {
                        break;
                    }
                }
            }
        }

        // anything still pending made no progress (task abort, cancel
        // before dispatch): terminal state is Skipped
        let leftover: Vec<String> = record
            .node_states
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in leftover {
            self.mark_terminal(record, &id, NodeStatus::Skipped, None, None);
        }
    }

    fn settle(
        &self,
        def: &PipelineDefinition,
        record: &mut ExecutionRecord,
        id: &str,
        result: Result<Message, NodeError>,
        outputs: &mut HashMap<String, Message>,
        in_deg: &mut HashMap<String, usize>,
        ready: &mut VecDeque<String>,
    ) {
        match result {
            Ok(msg) => {
                self.mark_terminal(
                    record,
                    id,
                    NodeStatus::Succeeded,
                    Some(msg.payload()),
                    None,
                );
                outputs.insert(id.to_string(), msg);
            }
            Err(err) => {
                warn!("Node {} failed: {}", id, err);
                self.mark_terminal(record, id, NodeStatus::Failed, None, Some(err));
            }
        }
        release_successors(def, id, in_deg, ready);
    }

    fn mark_terminal(
        &self,
        record: &mut ExecutionRecord,
        id: &str,
        status: NodeStatus,
        output: Option<Value>,
        error: Option<NodeError>,
    ) {
        record.node_states.insert(
            id.to_string(),
            NodeState {
                status,
                output,
                error,
            },
        );
    }
}

fn release_successors(
    def: &PipelineDefinition,
    id: &str,
    in_deg: &mut HashMap<String, usize>,
    ready: &mut VecDeque<String>,
) {
    let Some(idx) = def.node_index(id) else {
        return;
    };
    for succ in def.graph().neighbors_directed(idx, Direction::Outgoing) {
        let succ_id = def.graph()[succ].id.as_str();
        if let Some(d) = in_deg.get_mut(succ_id) {
            *d = d.saturating_sub(1);
            if *d == 0 {
                ready.push_back(succ_id.to_string());
            }
        }
    }
}

/// Build a node's input from its predecessors: the run input for source
/// nodes, a verbatim pass-through for a single declared predecessor, and
/// an array of `{node, output}` entries in connection-declaration order
/// when several predecessors merge. Failed or skipped predecessors drop
/// out of the merge.
fn node_input(
    run_id: &str,
    run_input: &Value,
    preds: &[&str],
    survivors: &[&str],
    outputs: &HashMap<String, Message>,
) -> Message {
    if preds.is_empty() {
        return Message::new(run_id, run_input.clone());
    }
    if preds.len() == 1 {
        return outputs
            .get(preds[0])
            .cloned()
            .unwrap_or_else(|| Message::new(run_id, Value::Null));
    }
    let merged: Vec<Value> = survivors
        .iter()
        .filter_map(|p| {
            outputs
                .get(*p)
                .map(|m| json!({ "node": p, "output": m.payload() }))
        })
        .collect();
    Message::new(run_id, Value::Array(merged))
}

fn final_output(def: &PipelineDefinition, record: &ExecutionRecord) -> Option<Value> {
    let mut output_nodes: Vec<&str> = def
        .output_nodes()
        .iter()
        .map(|n| n.id.as_str())
        .collect();
    output_nodes.sort();

    let mut produced: Vec<(&str, Value)> = output_nodes
        .into_iter()
        .filter_map(|id| {
            record
                .node_states
                .get(id)
                .and_then(|s| s.output.clone())
                .map(|v| (id, v))
        })
        .collect();

    match produced.len() {
        0 => None,
        1 => Some(produced.remove(0).1),
        _ => Some(Value::Object(
            produced
                .into_iter()
                .map(|(id, v)| (id.to_string(), v))
                .collect(),
        )),
    }
}

fn first_failure(record: &ExecutionRecord) -> Option<String> {
    let mut failed: Vec<(&String, &NodeState)> = record
        .node_states
        .iter()
        .filter(|(_, s)| s.status == NodeStatus::Failed)
        .collect();
    failed.sort_by_key(|(id, _)| id.as_str());
    failed.first().map(|(id, state)| {
        let detail = state
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        format!("node `{}` failed: {}", id, detail)
    })
}
