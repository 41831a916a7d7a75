// SPDX-License-Identifier: MIT

//! Stage plan for the staged strategy
//!
//! Nodes reachable from the entry are layered by longest path over the
//! scheduling edges (everything except `error` and `timeout`), using Kahn's
//! algorithm. A node's level is the earliest stage it may run in.

use std::collections::{HashMap, HashSet, VecDeque};

use super::types::{EdgeDefinition, EdgeKind, NodeDefinition};
use super::GraphError;

/// Longest-path levels of the reachable scheduling subgraph
#[derive(Debug, Clone)]
pub struct StagePlan {
    levels: HashMap<String, usize>,
    order: Vec<String>,
}

impl StagePlan {
    /// Build the plan, rejecting cycles
    pub fn build(
        entry: &str,
        nodes: &[NodeDefinition],
        edges: &[EdgeDefinition],
    ) -> Result<Self, GraphError> {
        let scheduling: Vec<&EdgeDefinition> = edges
            .iter()
            .filter(|e| !matches!(e.kind, EdgeKind::Error | EdgeKind::Timeout))
            .collect();

        // Reachable set from the entry
        let mut reachable: HashSet<&str> = HashSet::new();
        let mut queue = VecDeque::from([entry]);
        while let Some(id) = queue.pop_front() {
            if !reachable.insert(id) {
                continue;
            }
            for edge in scheduling.iter().filter(|e| e.source == id) {
                queue.push_back(edge.target.as_str());
            }
        }

        let mut in_degree: HashMap<&str, usize> = reachable.iter().map(|id| (*id, 0)).collect();
        for edge in &scheduling {
            if reachable.contains(edge.source.as_str()) {
                if let Some(degree) = in_degree.get_mut(edge.target.as_str()) {
                    *degree += 1;
                }
            }
        }

        // Seed in declaration order so the topological order is deterministic
        let mut queue: VecDeque<&str> = nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();
        let mut levels: HashMap<String, usize> = HashMap::new();
        let mut order = Vec::with_capacity(reachable.len());

        while let Some(id) = queue.pop_front() {
            let level = levels.get(id).copied().unwrap_or(0);
            levels.insert(id.to_string(), level);
            order.push(id.to_string());

            for edge in scheduling.iter().filter(|e| e.source == id) {
                let target = edge.target.as_str();
                let next = levels.entry(target.to_string()).or_insert(0);
                *next = (*next).max(level + 1);
                if let Some(degree) = in_degree.get_mut(target) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(target);
                    }
                }
            }
        }

        if order.len() < reachable.len() {
            let mut remaining: Vec<String> = reachable
                .iter()
                .filter(|id| !order.iter().any(|o| o == *id))
                .map(|id| id.to_string())
                .collect();
            remaining.sort();
            return Err(GraphError::Cycle(remaining));
        }

        Ok(Self { levels, order })
    }

    /// Stage level of a node, `None` when unreachable
    pub fn level(&self, node_id: &str) -> Option<usize> {
        self.levels.get(node_id).copied()
    }

    /// Reachable nodes in topological order
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Number of levels
    pub fn depth(&self) -> usize {
        self.levels.values().max().map(|m| m + 1).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[&str]) -> Vec<NodeDefinition> {
        ids.iter()
            .map(|id| serde_yaml::from_str(&format!("id: {}\ntype: decision", id)).unwrap())
            .collect()
    }

    fn edge(source: &str, target: &str, kind: EdgeKind) -> EdgeDefinition {
        EdgeDefinition {
            source: source.into(),
            target: target.into(),
            kind,
            label: None,
            condition: None,
            group: None,
            priority: 0,
        }
    }

    #[test]
    fn test_levels_use_longest_path() {
        // start -> a -> b -> join, start -> join
        let ns = nodes(&["start", "a", "b", "join"]);
        let es = vec![
            edge("start", "a", EdgeKind::Default),
            edge("a", "b", EdgeKind::Default),
            edge("b", "join", EdgeKind::Default),
            edge("start", "join", EdgeKind::Parallel),
        ];
        let plan = StagePlan::build("start", &ns, &es).unwrap();
        assert_eq!(plan.level("start"), Some(0));
        assert_eq!(plan.level("a"), Some(1));
        assert_eq!(plan.level("join"), Some(3));
        assert_eq!(plan.depth(), 4);
        assert_eq!(plan.order().first().map(String::as_str), Some("start"));
    }

    #[test]
    fn test_fan_out_siblings_share_a_level() {
        let ns = nodes(&["start", "x", "y", "z", "join"]);
        let es = vec![
            edge("start", "x", EdgeKind::Parallel),
            edge("start", "y", EdgeKind::Parallel),
            edge("start", "z", EdgeKind::Parallel),
            edge("x", "join", EdgeKind::Default),
            edge("y", "join", EdgeKind::Default),
            edge("z", "join", EdgeKind::Default),
        ];
        let plan = StagePlan::build("start", &ns, &es).unwrap();
        assert_eq!(plan.level("x"), plan.level("z"));
        assert_eq!(plan.level("join"), Some(2));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let ns = nodes(&["start", "a", "b"]);
        let es = vec![
            edge("start", "a", EdgeKind::Default),
            edge("a", "b", EdgeKind::Default),
            edge("b", "a", EdgeKind::Default),
        ];
        let err = StagePlan::build("start", &ns, &es).unwrap_err();
        assert!(matches!(err, GraphError::Cycle(ref ids) if ids == &["a", "b"]));
    }

    #[test]
    fn test_error_edges_do_not_form_cycles() {
        let ns = nodes(&["start", "a"]);
        let es = vec![
            edge("start", "a", EdgeKind::Default),
            edge("a", "start", EdgeKind::Error),
        ];
        assert!(StagePlan::build("start", &ns, &es).is_ok());
    }
}
