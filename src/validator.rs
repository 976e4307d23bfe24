use std::collections::{HashMap, HashSet};

use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};

use crate::pipeline::{NodeKind, PipelineDefinition};
use crate::registry::CapabilityRegistry;

/// Outcome of structural validation. `issues` is empty exactly when the
/// definition may be handed to the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<String>,
}

impl ValidationReport {
    fn from_issues(issues: Vec<String>) -> Self {
        Self {
            valid: issues.is_empty(),
            issues,
        }
    }
}

/// Check a built pipeline definition for structural correctness. Pure and
/// idempotent: repeated calls on the same definition return the same issue
/// list. Checks run in a fixed order and each produces a distinct issue
/// string.
pub fn validate(def: &PipelineDefinition, registry: &dyn CapabilityRegistry) -> ValidationReport {
    let mut issues = Vec::new();

    // node ids in sorted order so issue lists are stable across calls
    let mut node_ids: Vec<&String> = def.nodes().keys().collect();
    node_ids.sort();

    // 1 + 2: at least one entry and one exit
    if def.input_nodes().is_empty() {
        issues.push("missing input node".to_string());
    }
    if def.output_nodes().is_empty() {
        issues.push("missing output node".to_string());
    }

    // 3: every connection references existing node ids
    for conn in def.connections() {
        if def.node(&conn.from).is_none() {
            issues.push(format!(
                "connection `{}` -> `{}` references unknown node `{}`",
                conn.from, conn.to, conn.from
            ));
        }
        if def.node(&conn.to).is_none() {
            issues.push(format!(
                "connection `{}` -> `{}` references unknown node `{}`",
                conn.from, conn.to, conn.to
            ));
        }
    }

    // 4: no self-loops, no duplicate (from, to) pairs
    let mut seen = HashSet::new();
    for conn in def.connections() {
        if conn.from == conn.to {
            issues.push(format!("self-loop connection on node `{}`", conn.from));
        }
        if !seen.insert((conn.from.clone(), conn.to.clone())) {
            issues.push(format!(
                "duplicate connection `{}` -> `{}`",
                conn.from, conn.to
            ));
        }
    }

    // adjacency over declared edges with valid endpoints
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for conn in def.connections() {
        if def.node(&conn.from).is_some() && def.node(&conn.to).is_some() {
            adjacency
                .entry(conn.from.as_str())
                .or_default()
                .push(conn.to.as_str());
        }
    }

    // 5: the connection graph is acyclic
    if let Some(cycle) = find_cycle(&node_ids, &adjacency) {
        issues.push(format!(
            "cycle detected involving nodes: {}",
            cycle.join(", ")
        ));
    }

    // every node must be reachable from some input, walking the built
    // graph (dangling connections were dropped by `build`)
    let mut reachable: HashSet<&str> = HashSet::new();
    for input in def.input_nodes() {
        let Some(start) = def.node_index(&input.id) else {
            continue;
        };
        let mut dfs = Dfs::new(def.graph(), start);
        while let Some(idx) = dfs.next(def.graph()) {
            reachable.insert(def.graph()[idx].id.as_str());
        }
    }
    for id in &node_ids {
        if !reachable.contains(id.as_str()) && def.node(id).map(|n| n.kind != NodeKind::Input).unwrap_or(false) {
            issues.push(format!("node `{}` is not reachable from any input node", id));
        }
    }

    // 6: per-type config must resolve against the capability registry
    for id in &node_ids {
        let node = &def.nodes()[*id];
        match &node.kind {
            NodeKind::AgentCall { agent_id } => {
                if registry.get_agent(agent_id).is_err() {
                    issues.push(format!(
                        "node `{}` references unknown agent `{}`",
                        id, agent_id
                    ));
                }
            }
            NodeKind::McpToolCall {
                server_id,
                tool_name,
            } => {
                if tool_name.trim().is_empty() {
                    issues.push(format!("node `{}` has an empty tool name", id));
                }
                if registry.get_server(server_id).is_err() {
                    issues.push(format!(
                        "node `{}` references unknown MCP server `{}`",
                        id, server_id
                    ));
                }
            }
            NodeKind::Input | NodeKind::Output | NodeKind::TextTransform { .. } => {}
        }
    }

    ValidationReport::from_issues(issues)
}

/// Depth-first search with an explicit recursion stack; a node
/// re-encountered while still on the active stack closes a cycle. Returns
/// the node ids on the cycle, in walk order.
fn find_cycle<'a>(
    node_ids: &[&'a String],
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
) -> Option<Vec<String>> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut on_stack: Vec<&str> = Vec::new();

    fn visit<'a>(
        id: &'a str,
        adjacency: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        on_stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = on_stack.iter().position(|&n| n == id) {
            return Some(on_stack[pos..].iter().map(|s| s.to_string()).collect());
        }
        if !visited.insert(id) {
            return None;
        }
        on_stack.push(id);
        if let Some(succs) = adjacency.get(id) {
            for succ in succs {
                if let Some(cycle) = visit(succ, adjacency, visited, on_stack) {
                    return Some(cycle);
                }
            }
        }
        on_stack.pop();
        None
    }

    for id in node_ids {
        if let Some(cycle) = visit(id.as_str(), adjacency, &mut visited, &mut on_stack) {
            return Some(cycle);
        }
    }
    None
}
