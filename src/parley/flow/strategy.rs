// SPDX-License-Identifier: MIT

//! Strategy selection: which runner drives a session

use serde::{Deserialize, Serialize};

use super::graph::FlowGraph;
use super::registry::ExecutorRegistry;

/// Routing engine for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// One active node at a time
    Sequential,
    /// Topological stages with concurrent members
    Staged,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Sequential => write!(f, "sequential"),
            Strategy::Staged => write!(f, "staged"),
        }
    }
}

/// Why a strategy was picked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionReason {
    /// Flow metadata names a strategy
    Hint,
    /// A node can route dynamically
    DynamicRouting { node_id: String },
    Default,
}

impl std::fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectionReason::Hint => write!(f, "explicit flow hint"),
            SelectionReason::DynamicRouting { node_id } => {
                write!(f, "node '{}' routes dynamically", node_id)
            }
            SelectionReason::Default => write!(f, "safe default"),
        }
    }
}

/// Pick the strategy for a new session of `graph`
pub fn select(graph: &FlowGraph, registry: &ExecutorRegistry) -> (Strategy, SelectionReason) {
    if let Some(hint) = graph.strategy_hint() {
        return (hint, SelectionReason::Hint);
    }

    let dynamic = graph.nodes().find(|node| {
        registry
            .get(node.node_type())
            .map(|executor| executor.routes_dynamically())
            .unwrap_or(false)
    });
    if let Some(node) = dynamic {
        return (
            Strategy::Sequential,
            SelectionReason::DynamicRouting {
                node_id: node.id.clone(),
            },
        );
    }

    (Strategy::Sequential, SelectionReason::Default)
}
