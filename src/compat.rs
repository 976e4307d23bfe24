use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::registry::{AgentProfile, ServerProfile};

/// Discrete classification of how well an agent's and a server's
/// capability tags overlap.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompatibilityLevel {
    Incompatible,
    Minimal,
    Low,
    Medium,
    High,
    Perfect,
}

impl CompatibilityLevel {
    /// Threshold boundaries round up: a score sitting exactly on a
    /// threshold takes the higher level.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            CompatibilityLevel::Perfect
        } else if score >= 0.7 {
            CompatibilityLevel::High
        } else if score >= 0.4 {
            CompatibilityLevel::Medium
        } else if score >= 0.2 {
            CompatibilityLevel::Low
        } else if score > 0.0 {
            CompatibilityLevel::Minimal
        } else {
            CompatibilityLevel::Incompatible
        }
    }
}

/// Result of scoring one (agent, server) pair. `matched`/`missing` list the
/// server's tags from the agent's point of view, so callers can surface
/// what a coupling would and would not cover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompatibilityReport {
    pub score: f64,
    pub level: CompatibilityLevel,
    pub matched: Vec<String>,
    pub missing: Vec<String>,
}

// Tags intersect when they share a word token, so `incident` pairs with
// `incident_management`. Exact-equal tags are the degenerate case.
fn tags_overlap(a: &str, b: &str) -> bool {
    let words_a: BTreeSet<&str> = split_words(a).collect();
    split_words(b).any(|w| words_a.contains(w))
}

fn split_words(tag: &str) -> impl Iterator<Item = &str> {
    tag.split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|w| !w.is_empty())
}

/// Score a pair of capability tag-sets: the Jaccard index over the fuzzy
/// tag intersection, in [0, 1]. Deterministic and pure; tags are expected
/// lower-cased (the registry normalizes them).
pub fn score(
    agent_tags: &BTreeSet<String>,
    server_tags: &BTreeSet<String>,
) -> CompatibilityReport {
    if agent_tags.is_empty() || server_tags.is_empty() {
        return CompatibilityReport {
            score: 0.0,
            level: CompatibilityLevel::Incompatible,
            matched: Vec::new(),
            missing: server_tags.iter().cloned().collect(),
        };
    }

    let matched_agent = agent_tags
        .iter()
        .filter(|a| server_tags.iter().any(|s| tags_overlap(a, s)))
        .count();

    let mut matched = Vec::new();
    let mut missing = Vec::new();
    for s in server_tags {
        if agent_tags.iter().any(|a| tags_overlap(a, s)) {
            matched.push(s.clone());
        } else {
            missing.push(s.clone());
        }
    }

    let intersection = matched_agent.min(matched.len());
    let union = agent_tags.len() + server_tags.len() - intersection;
    let score = if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    };

    CompatibilityReport {
        score,
        level: CompatibilityLevel::from_score(score),
        matched,
        missing,
    }
}

/// Convenience wrapper over profiles from the capability registry.
pub fn analyze(agent: &AgentProfile, server: &ServerProfile) -> CompatibilityReport {
    score(&agent.tags, &server.tags)
}
