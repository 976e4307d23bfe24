use std::{
    collections::HashMap,
    fs,
};

use petgraph::{graph::NodeIndex, prelude::StableDiGraph};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Deterministic string operation for `text_transform` nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextOperation {
    Uppercase,
    Lowercase,
    Reverse,
    WordCount,
}

/// Node kinds, tagged by the `type` key. The set is closed on purpose:
/// adding a kind is a compile-time change, and a definition naming an
/// unknown type is rejected when it is parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Input,
    Output,
    TextTransform { operation: TextOperation },
    AgentCall { agent_id: String },
    McpToolCall { server_id: String, tool_name: String },
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Input => "input",
            NodeKind::Output => "output",
            NodeKind::TextTransform { .. } => "text_transform",
            NodeKind::AgentCall { .. } => "agent_call",
            NodeKind::McpToolCall { .. } => "mcp_tool_call",
        }
    }

    /// External calls suspend on I/O and count against the run's
    /// concurrency budget; the rest run inline.
    pub fn is_external(&self) -> bool {
        matches!(self, NodeKind::AgentCall { .. } | NodeKind::McpToolCall { .. })
    }
}

/// A single node's config in the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub id: String,
    pub kind: NodeKind,
    pub label: Option<String>,
}

impl NodeConfig {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

// matches the JSON shape of a node, minus the `id` field
#[derive(Serialize, Deserialize)]
struct RawNodeConfig {
    #[serde(flatten)]
    kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
}

// re-use the normal Serde impl for the map, then inject the key as `id`
fn deserialize_nodes_with_id<'de, D>(
    deserializer: D,
) -> Result<HashMap<String, NodeConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: HashMap<String, RawNodeConfig> = HashMap::deserialize(deserializer)?;
    let mut out = HashMap::with_capacity(raw.len());
    for (key, r) in raw {
        out.insert(
            key.clone(),
            NodeConfig {
                id: key,
                kind: r.kind,
                label: r.label,
            },
        );
    }
    Ok(out)
}

// hide `id` when serializing back out so the file round-trips cleanly
fn serialize_nodes<S>(
    nodes: &HashMap<String, NodeConfig>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(nodes.len()))?;
    for (k, v) in nodes {
        let raw = RawNodeConfig {
            kind: v.kind.clone(),
            label: v.label.clone(),
        };
        map.serialize_entry(k, &raw)?;
    }
    map.end()
}

/// A directed edge from one node's output to another node's input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub from: String,
    pub to: String,
}

impl Connection {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// A declarative pipeline: id/name/description/version, map of
/// node-configs, and an ordered list of connections. Connection order is
/// load-bearing: it fixes the merge order when a node has several
/// predecessors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_version")]
    version: u32,

    /// node_id → node configuration
    #[serde(
        deserialize_with = "deserialize_nodes_with_id",
        serialize_with = "serialize_nodes"
    )]
    nodes: HashMap<String, NodeConfig>,

    connections: Vec<Connection>,

    #[serde(skip)]
    graph: StableDiGraph<NodeConfig, ()>,
    #[serde(skip)]
    index_of: HashMap<String, NodeIndex>,
}

fn default_version() -> u32 {
    1
}

impl PartialEq for PipelineDefinition {
    fn eq(&self, other: &Self) -> bool {
        // the graph and index are derived; structural identity is what counts
        self.id == other.id
            && self.name == other.name
            && self.description == other.description
            && self.version == other.version
            && self.nodes == other.nodes
            && self.connections == other.connections
    }
}

impl PipelineDefinition {
    /// Create a new, empty pipeline with the given identifiers.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        PipelineDefinition {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            version: default_version(),
            nodes: HashMap::new(),
            connections: Vec::new(),
            graph: StableDiGraph::new(),
            index_of: HashMap::new(),
        }
    }

    pub fn id(&self) -> String {
        self.id.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn nodes(&self) -> &HashMap<String, NodeConfig> {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&NodeConfig> {
        self.nodes.get(id)
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn add_node(&mut self, node: NodeConfig) -> Option<NodeConfig> {
        self.nodes.insert(node.id.clone(), node)
    }

    pub fn add_connection(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.connections.push(Connection::new(from, to));
    }

    /// Build the internal petgraph view. Edges whose endpoints are
    /// missing are left out here; the validator reports them.
    pub fn build(mut self) -> Self {
        let mut graph = StableDiGraph::new();
        let mut index_of = HashMap::new();

        for (nid, cfg) in &self.nodes {
            let idx = graph.add_node(cfg.clone());
            index_of.insert(nid.clone(), idx);
        }

        for conn in &self.connections {
            if let (Some(&i), Some(&j)) = (index_of.get(&conn.from), index_of.get(&conn.to)) {
                graph.add_edge(i, j, ());
            }
        }

        self.graph = graph;
        self.index_of = index_of;
        self
    }

    pub fn graph(&self) -> &StableDiGraph<NodeConfig, ()> {
        &self.graph
    }

    pub fn node_index(&self, id: &str) -> Option<NodeIndex> {
        self.index_of.get(id).copied()
    }

    /// Predecessors of `node_id` in connection-declaration order.
    pub fn predecessors(&self, node_id: &str) -> Vec<&str> {
        self.connections
            .iter()
            .filter(|c| c.to == node_id)
            .map(|c| c.from.as_str())
            .collect()
    }

    pub fn input_nodes(&self) -> Vec<&NodeConfig> {
        self.nodes
            .values()
            .filter(|n| n.kind == NodeKind::Input)
            .collect()
    }

    pub fn output_nodes(&self) -> Vec<&NodeConfig> {
        self.nodes
            .values()
            .filter(|n| n.kind == NodeKind::Output)
            .collect()
    }

    /// Agent ids referenced by `agent_call` nodes; the MCP tool-call
    /// executor resolves couplings against these.
    pub fn agent_context(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .nodes
            .values()
            .filter_map(|n| match &n.kind {
                NodeKind::AgentCall { agent_id } => Some(agent_id.clone()),
                _ => None,
            })
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn load_from_file(path: &str) -> Result<Self, PipelineError> {
        let json = fs::read_to_string(path)
            .map_err(|e| PipelineError::Io(format!("read error: {}", e)))?;
        let def: PipelineDefinition = serde_json::from_str(&json)
            .map_err(|e| PipelineError::Serialization(format!("parse error: {}", e)))?;
        Ok(def.build())
    }

    pub fn save_to_file(&self, path: &str) -> Result<(), PipelineError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::Serialization(format!("{}", e)))?;
        fs::write(path, json).map_err(|e| PipelineError::Io(format!("{}", e)))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("JSON error: {0}")]
    Serialization(String),
}
