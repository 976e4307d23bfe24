use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{Barrier, Mutex};

use agentflow::config::EngineConfig;
use agentflow::engine::Engine;
use agentflow::execution::{ExecutionStatus, NodeStatus};
use agentflow::executor::ExecuteError;
use agentflow::gateway::{GatewayError, LlmGateway};
use agentflow::mcp::{McpClient, McpError, NullMcpClient};
use agentflow::node::CallErrorKind;
use agentflow::pipeline::{NodeConfig, NodeKind, PipelineDefinition, TextOperation};
use agentflow::registry::{AgentProfile, InMemoryCapabilityRegistry, ServerProfile};
use agentflow::store::{InMemoryExecutionRepository, InMemoryPipelineRepository};

/// Gateway that completes instantly and records every prompt it saw.
struct EchoGateway {
    prompts: Mutex<Vec<String>>,
}

impl EchoGateway {
    fn new() -> Self {
        Self {
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LlmGateway for EchoGateway {
    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        _timeout: Duration,
    ) -> Result<String, GatewayError> {
        self.prompts.lock().await.push(prompt.to_string());
        Ok(format!("echo[{model}]: {prompt}"))
    }
}

/// Gateway that sleeps before answering, for timeout and cancel tests.
struct SlowGateway {
    delay: Duration,
}

#[async_trait]
impl LlmGateway for SlowGateway {
    async fn complete(
        &self,
        prompt: &str,
        _model: &str,
        timeout: Duration,
    ) -> Result<String, GatewayError> {
        if self.delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(GatewayError::Timeout);
        }
        tokio::time::sleep(self.delay).await;
        Ok(prompt.to_string())
    }
}

/// Gateway that always fails with a provider error.
struct BrokenGateway;

#[async_trait]
impl LlmGateway for BrokenGateway {
    async fn complete(
        &self,
        _prompt: &str,
        _model: &str,
        _timeout: Duration,
    ) -> Result<String, GatewayError> {
        Err(GatewayError::Provider("model backend is down".to_string()))
    }
}

/// Gateway that only answers once two calls have arrived concurrently.
struct BarrierGateway {
    barrier: Barrier,
}

#[async_trait]
impl LlmGateway for BarrierGateway {
    async fn complete(
        &self,
        prompt: &str,
        _model: &str,
        _timeout: Duration,
    ) -> Result<String, GatewayError> {
        self.barrier.wait().await;
        Ok(prompt.to_string())
    }
}

/// Gateway that cancels its own run before answering, so the token fires
/// while downstream nodes are still waiting to dispatch.
struct SelfCancellingGateway {
    engine: Mutex<Option<Arc<Engine>>>,
}

#[async_trait]
impl LlmGateway for SelfCancellingGateway {
    async fn complete(
        &self,
        prompt: &str,
        _model: &str,
        _timeout: Duration,
    ) -> Result<String, GatewayError> {
        if let Some(engine) = self.engine.lock().await.as_ref() {
            for id in engine.active_executions() {
                engine.cancel_execution(&id);
            }
        }
        Ok(prompt.to_string())
    }
}

/// MCP client that wraps the params it was called with.
struct WrappingMcp;

#[async_trait]
impl McpClient for WrappingMcp {
    async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        params: Value,
    ) -> Result<Value, McpError> {
        Ok(json!({ "server": server_id, "tool": tool_name, "params": params }))
    }

    async fn list_tools(&self, _server_id: &str) -> Result<Vec<String>, McpError> {
        Ok(vec!["create_incident".into()])
    }
}

fn registry() -> Arc<InMemoryCapabilityRegistry> {
    let registry = Arc::new(InMemoryCapabilityRegistry::new());
    registry.register_agent(
        AgentProfile::new("sre_01", "SRE Agent")
            .with_tags(["servicenow", "incident"])
            .with_model("gpt-4o-mini"),
    );
    registry.register_server(
        ServerProfile::new("snow", "ServiceNow")
            .with_tags(["incident_management", "servicenow"])
            .with_tools(["create_incident"]),
    );
    registry
}

fn engine_with(gateway: Arc<dyn LlmGateway>, mcp: Arc<dyn McpClient>) -> Engine {
    engine_with_config(gateway, mcp, EngineConfig::default())
}

fn engine_with_config(
    gateway: Arc<dyn LlmGateway>,
    mcp: Arc<dyn McpClient>,
    config: EngineConfig,
) -> Engine {
    Engine::new(
        registry(),
        gateway,
        mcp,
        Arc::new(InMemoryPipelineRepository::new()),
        Arc::new(InMemoryExecutionRepository::new()),
        config,
    )
}

fn uppercase_pipeline() -> PipelineDefinition {
    let mut def = PipelineDefinition::new("upper", "uppercase", "");
    def.add_node(NodeConfig::new("in", NodeKind::Input));
    def.add_node(NodeConfig::new(
        "shout",
        NodeKind::TextTransform {
            operation: TextOperation::Uppercase,
        },
    ));
    def.add_node(NodeConfig::new("out", NodeKind::Output));
    def.add_connection("in", "shout");
    def.add_connection("shout", "out");
    def.build()
}

fn agent_pipeline(pipeline_id: &str) -> PipelineDefinition {
    let mut def = PipelineDefinition::new(pipeline_id, "agent chain", "");
    def.add_node(NodeConfig::new("in", NodeKind::Input));
    def.add_node(NodeConfig::new("agent", NodeKind::AgentCall {
        agent_id: "sre_01".into(),
    }));
    def.add_node(NodeConfig::new("out", NodeKind::Output));
    def.add_connection("in", "agent");
    def.add_connection("agent", "out");
    def.build()
}

#[tokio::test]
async fn uppercase_pipeline_produces_expected_output() {
    let engine = engine_with(Arc::new(EchoGateway::new()), Arc::new(NullMcpClient));
    let record = engine
        .execute_pipeline(&uppercase_pipeline(), json!("hello world"))
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Succeeded);
    assert_eq!(record.output, Some(json!("HELLO WORLD")));
    for id in ["in", "shout", "out"] {
        assert_eq!(record.node_status(id), Some(NodeStatus::Succeeded));
    }
}

#[tokio::test]
async fn cyclic_pipeline_is_rejected_before_any_node_runs() {
    let mut def = PipelineDefinition::new("cyclic", "a<->b", "");
    def.add_node(NodeConfig::new("in", NodeKind::Input));
    def.add_node(NodeConfig::new("a", NodeKind::TextTransform {
        operation: TextOperation::Uppercase,
    }));
    def.add_node(NodeConfig::new("b", NodeKind::TextTransform {
        operation: TextOperation::Lowercase,
    }));
    def.add_node(NodeConfig::new("out", NodeKind::Output));
    def.add_connection("in", "a");
    def.add_connection("a", "b");
    def.add_connection("b", "a");
    def.add_connection("a", "out");
    let def = def.build();

    let engine = engine_with(Arc::new(EchoGateway::new()), Arc::new(NullMcpClient));
    let err = engine.execute_pipeline(&def, json!("x")).await.unwrap_err();
    let ExecuteError::Validation { issues } = err;
    assert!(issues.iter().any(|i| i.starts_with("cycle detected")));

    // rejected before a record was created
    assert!(engine.list_executions().await.is_empty());
}

#[tokio::test]
async fn missing_output_node_fails_validation() {
    let mut def = PipelineDefinition::new("no_out", "", "");
    def.add_node(NodeConfig::new("in", NodeKind::Input));
    let def = def.build();

    let engine = engine_with(Arc::new(EchoGateway::new()), Arc::new(NullMcpClient));
    let report = engine.validate_pipeline(&def);
    assert!(!report.valid);
    assert!(report.issues.contains(&"missing output node".to_string()));
}

#[tokio::test]
async fn diamond_merges_predecessor_outputs_in_declaration_order() {
    let mut def = PipelineDefinition::new("diamond", "", "");
    def.add_node(NodeConfig::new("in", NodeKind::Input));
    def.add_node(NodeConfig::new("a", NodeKind::TextTransform {
        operation: TextOperation::Uppercase,
    }));
    def.add_node(NodeConfig::new("b", NodeKind::TextTransform {
        operation: TextOperation::Reverse,
    }));
    def.add_node(NodeConfig::new("out", NodeKind::Output));
    def.add_connection("in", "a");
    def.add_connection("in", "b");
    def.add_connection("a", "out");
    def.add_connection("b", "out");
    let def = def.build();

    let engine = engine_with(Arc::new(EchoGateway::new()), Arc::new(NullMcpClient));
    let record = engine.execute_pipeline(&def, json!("abc")).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Succeeded);
    assert_eq!(
        record.output,
        Some(json!([
            { "node": "a", "output": "ABC" },
            { "node": "b", "output": "cba" },
        ]))
    );
}

#[tokio::test]
async fn independent_branches_run_concurrently() {
    // both agent calls block on a two-party barrier; serialized dispatch
    // would deadlock, so finishing at all proves concurrency
    let mut def = PipelineDefinition::new("parallel", "", "");
    def.add_node(NodeConfig::new("in", NodeKind::Input));
    def.add_node(NodeConfig::new("a", NodeKind::AgentCall {
        agent_id: "sre_01".into(),
    }));
    def.add_node(NodeConfig::new("b", NodeKind::AgentCall {
        agent_id: "sre_01".into(),
    }));
    def.add_node(NodeConfig::new("out", NodeKind::Output));
    def.add_connection("in", "a");
    def.add_connection("in", "b");
    def.add_connection("a", "out");
    def.add_connection("b", "out");
    let def = def.build();

    let gateway = Arc::new(BarrierGateway {
        barrier: Barrier::new(2),
    });
    let engine = engine_with(gateway, Arc::new(NullMcpClient));

    let record = tokio::time::timeout(
        Duration::from_secs(5),
        engine.execute_pipeline(&def, json!("go")),
    )
    .await
    .expect("branches did not run concurrently")
    .unwrap();
    assert_eq!(record.status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn chained_agents_run_in_dependency_order() {
    let mut def = PipelineDefinition::new("chain", "", "");
    def.add_node(NodeConfig::new("in", NodeKind::Input));
    def.add_node(NodeConfig::new("first", NodeKind::AgentCall {
        agent_id: "sre_01".into(),
    }));
    def.add_node(NodeConfig::new("second", NodeKind::AgentCall {
        agent_id: "sre_01".into(),
    }));
    def.add_node(NodeConfig::new("out", NodeKind::Output));
    def.add_connection("in", "first");
    def.add_connection("first", "second");
    def.add_connection("second", "out");
    let def = def.build();

    let gateway = Arc::new(EchoGateway::new());
    let engine = engine_with(gateway.clone(), Arc::new(NullMcpClient));
    let record = engine.execute_pipeline(&def, json!("seed")).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Succeeded);

    // the second prompt must contain the first call's completion
    let prompts = gateway.prompts.lock().await;
    assert_eq!(prompts.len(), 2);
    assert_eq!(prompts[0], "seed");
    assert!(prompts[1].contains("echo["));
}

#[tokio::test]
async fn concurrent_executions_get_independent_records() {
    let engine = Arc::new(engine_with(
        Arc::new(EchoGateway::new()),
        Arc::new(NullMcpClient),
    ));
    let def = Arc::new(uppercase_pipeline());

    let first = {
        let engine = engine.clone();
        let def = def.clone();
        tokio::spawn(async move { engine.execute_pipeline(&def, json!("one")).await })
    };
    let second = {
        let engine = engine.clone();
        let def = def.clone();
        tokio::spawn(async move { engine.execute_pipeline(&def, json!("two")).await })
    };

    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();

    assert_ne!(a.id, b.id);
    let mut outputs = vec![a.output.unwrap(), b.output.unwrap()];
    outputs.sort_by_key(|v| v.as_str().map(String::from));
    assert_eq!(outputs, vec![json!("ONE"), json!("TWO")]);
    assert_eq!(engine.list_executions().await.len(), 2);
}

#[tokio::test]
async fn failed_branch_is_skipped_while_alternate_path_completes() {
    // in -> fail -> late -> out
    // in -> ok ---------> out
    let mut def = PipelineDefinition::new("degrade", "", "");
    def.add_node(NodeConfig::new("in", NodeKind::Input));
    def.add_node(NodeConfig::new("fail", NodeKind::AgentCall {
        agent_id: "sre_01".into(),
    }));
    def.add_node(NodeConfig::new("late", NodeKind::TextTransform {
        operation: TextOperation::Uppercase,
    }));
    def.add_node(NodeConfig::new("ok", NodeKind::TextTransform {
        operation: TextOperation::Reverse,
    }));
    def.add_node(NodeConfig::new("out", NodeKind::Output));
    def.add_connection("in", "fail");
    def.add_connection("fail", "late");
    def.add_connection("in", "ok");
    def.add_connection("late", "out");
    def.add_connection("ok", "out");
    let def = def.build();

    let engine = engine_with(Arc::new(BrokenGateway), Arc::new(NullMcpClient));
    let record = engine.execute_pipeline(&def, json!("abc")).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.node_status("fail"), Some(NodeStatus::Failed));
    assert_eq!(record.node_status("late"), Some(NodeStatus::Skipped));
    assert_eq!(record.node_status("ok"), Some(NodeStatus::Succeeded));
    // out still ran through the surviving branch
    assert_eq!(record.node_status("out"), Some(NodeStatus::Succeeded));
    assert_eq!(record.output, Some(json!([{ "node": "ok", "output": "cba" }])));

    let state = &record.node_states["fail"];
    assert_eq!(
        state.error.as_ref().and_then(|e| e.kind()),
        Some(CallErrorKind::ProviderError)
    );
}

#[tokio::test]
async fn slow_agent_call_fails_with_timeout_kind() {
    let config = EngineConfig::default().with_call_timeout(Duration::from_millis(50));
    let gateway = Arc::new(SlowGateway {
        delay: Duration::from_secs(10),
    });
    let engine = engine_with_config(gateway, Arc::new(NullMcpClient), config);

    let record = engine
        .execute_pipeline(&agent_pipeline("slow"), json!("hi"))
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    let state = &record.node_states["agent"];
    assert_eq!(state.status, NodeStatus::Failed);
    assert_eq!(
        state.error.as_ref().and_then(|e| e.kind()),
        Some(CallErrorKind::Timeout)
    );
    assert_eq!(record.node_status("out"), Some(NodeStatus::Skipped));
}

#[tokio::test]
async fn cancelled_run_fails_in_flight_nodes_and_skips_the_rest() {
    let config = EngineConfig::default().with_call_timeout(Duration::from_secs(60));
    let gateway = Arc::new(SlowGateway {
        delay: Duration::from_secs(30),
    });
    let engine = Arc::new(engine_with_config(gateway, Arc::new(NullMcpClient), config));

    let run = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .execute_pipeline(&agent_pipeline("cancelme"), json!("hi"))
                .await
        })
    };

    // wait until the run registers, then cancel it
    let execution_id = loop {
        let active = engine.active_executions();
        if let Some(id) = active.first() {
            break id.clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert!(engine.cancel_execution(&execution_id));

    let record = run.await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    let state = &record.node_states["agent"];
    assert_eq!(state.status, NodeStatus::Failed);
    assert_eq!(
        state.error.as_ref().and_then(|e| e.kind()),
        Some(CallErrorKind::Cancelled)
    );
    assert_eq!(record.node_status("out"), Some(NodeStatus::Skipped));

    // cancelling a finished run is a no-op
    assert!(!engine.cancel_execution(&execution_id));
}

#[tokio::test]
async fn cancel_between_node_settles_never_reports_success() {
    let gateway = Arc::new(SelfCancellingGateway {
        engine: Mutex::new(None),
    });
    let engine = Arc::new(engine_with(gateway.clone(), Arc::new(NullMcpClient)));
    *gateway.engine.lock().await = Some(engine.clone());

    let record = engine
        .execute_pipeline(&agent_pipeline("mid_cancel"), json!("hi"))
        .await
        .unwrap();

    // every node either finished or was skipped, yet the run is Failed
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.error.is_some());
    assert_eq!(record.node_status("out"), Some(NodeStatus::Skipped));
}

#[tokio::test]
async fn mcp_tool_call_requires_an_active_coupling() {
    let mut def = PipelineDefinition::new("tooling", "", "");
    def.add_node(NodeConfig::new("in", NodeKind::Input));
    def.add_node(NodeConfig::new("agent", NodeKind::AgentCall {
        agent_id: "sre_01".into(),
    }));
    def.add_node(NodeConfig::new("tool", NodeKind::McpToolCall {
        server_id: "snow".into(),
        tool_name: "create_incident".into(),
    }));
    def.add_node(NodeConfig::new("out", NodeKind::Output));
    def.add_connection("in", "agent");
    def.add_connection("agent", "tool");
    def.add_connection("tool", "out");
    let def = def.build();

    let engine = engine_with(Arc::new(EchoGateway::new()), Arc::new(WrappingMcp));

    // no coupling yet: the tool node fails with a tool error
    let record = engine.execute_pipeline(&def, json!("page the sre")).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(
        record.node_states["tool"].error.as_ref().and_then(|e| e.kind()),
        Some(CallErrorKind::ToolError)
    );

    // create, test, activate; the same pipeline now succeeds
    let coupling = engine.create_coupling("sre_01", "snow", false).await.unwrap();
    assert!(engine.test_coupling(&coupling.id).await.unwrap().ok);
    engine.activate_coupling(&coupling.id).await.unwrap();

    let record = engine.execute_pipeline(&def, json!("page the sre")).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Succeeded);
    let output = record.output.unwrap();
    assert_eq!(output["server"], json!("snow"));
    assert_eq!(output["tool"], json!("create_incident"));

    // disconnect puts the tool path out of service again
    engine.disconnect_coupling(&coupling.id).unwrap();
    let record = engine.execute_pipeline(&def, json!("page the sre")).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn analyze_compatibility_matches_spec_examples() {
    let engine = engine_with(Arc::new(EchoGateway::new()), Arc::new(NullMcpClient));

    let report = engine.analyze_compatibility("sre_01", "snow").unwrap();
    assert!(report.score > 0.0);
    assert!(report.level >= agentflow::compat::CompatibilityLevel::High);
}

#[tokio::test]
async fn pipeline_repository_round_trip_through_engine() {
    let engine = engine_with(Arc::new(EchoGateway::new()), Arc::new(NullMcpClient));
    let def = uppercase_pipeline();
    engine.save_pipeline(def.clone()).await;

    let loaded = engine.get_pipeline("upper").await.unwrap();
    assert_eq!(loaded, def);

    let record = engine
        .execute_pipeline_by_id("upper", json!("by id"))
        .await
        .unwrap();
    assert_eq!(record.output, Some(json!("BY ID")));
    assert_eq!(record.pipeline_id, "upper");

    let fetched = engine.get_execution(&record.id).await.unwrap();
    assert_eq!(fetched.id, record.id);

    engine.delete_pipeline("upper").await;
    assert!(engine.get_pipeline("upper").await.is_none());
}
