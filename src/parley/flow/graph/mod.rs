// SPDX-License-Identifier: MIT

//! Validated, immutable flow graphs
//!
//! A [`FlowGraph`] is built once from a [`FlowDefinition`] and shared via
//! `Arc` by every session of that flow. All integrity checks happen here, so
//! the runners can trust edges to resolve and expressions to parse.

mod plan;
pub mod types;

pub use plan::StagePlan;
pub use types::{
    DecisionConfig, EdgeDefinition, EdgeKind, ElicitConfig, EndConfig, EntryConfig, FanInConfig,
    FanOutConfig, FlowDefinition, FlowMetadata, LlmConfig, MemoryLookup, NodeDefinition,
    NodeKind, NodeType, ToolCallConfig, TransferConfig, Validator, WaitConfig, WaitMode,
};

use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

use crate::parley::flow::condition::{parse, ExpressionError, Template};
use crate::parley::flow::strategy::Strategy;

/// Longest deadline a wait node may set (ten years)
pub const MAX_WAIT_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Load-time integrity failures
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Flow has no nodes")]
    Empty,

    #[error("Duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("Edge {source_id} -> {target_id} references unknown node '{missing}'")]
    DanglingEdge {
        source_id: String,
        target_id: String,
        missing: String,
    },

    #[error("Flow has no entry node")]
    MissingEntry,

    #[error("Flow has more than one entry node: {0:?}")]
    MultipleEntries(Vec<String>),

    #[error("Node '{0}' is not reachable from the entry")]
    Unreachable(String),

    #[error("Staged flow contains a cycle through {0:?}")]
    Cycle(Vec<String>),

    #[error("Node '{node_id}' has an invalid expression: {source}")]
    InvalidExpression {
        node_id: String,
        #[source]
        source: ExpressionError,
    },

    #[error("Node '{node_id}' is invalid: {message}")]
    InvalidNode { node_id: String, message: String },
}

impl GraphError {
    fn invalid(node_id: &str, message: impl Into<String>) -> Self {
        Self::InvalidNode {
            node_id: node_id.to_string(),
            message: message.into(),
        }
    }

    fn expression(node_id: &str, source: ExpressionError) -> Self {
        Self::InvalidExpression {
            node_id: node_id.to_string(),
            source,
        }
    }
}

/// A validated flow with precomputed adjacency
#[derive(Debug, Clone)]
pub struct FlowGraph {
    definition: FlowDefinition,
    index: HashMap<String, usize>,
    outgoing: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, Vec<usize>>,
    entry: usize,
    plan: Option<StagePlan>,
}

impl FlowGraph {
    /// Validate a definition and build the graph
    pub fn new(definition: FlowDefinition) -> Result<Self, GraphError> {
        if definition.nodes.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut index = HashMap::new();
        for (i, node) in definition.nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
        }

        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, edge) in definition.edges.iter().enumerate() {
            for end in [&edge.source, &edge.target] {
                if !index.contains_key(end) {
                    return Err(GraphError::DanglingEdge {
                        source_id: edge.source.clone(),
                        target_id: edge.target.clone(),
                        missing: end.clone(),
                    });
                }
            }
            outgoing.entry(edge.source.clone()).or_default().push(i);
            incoming.entry(edge.target.clone()).or_default().push(i);
        }

        let entries: Vec<usize> = definition
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.node_type() == NodeType::Entry)
            .map(|(i, _)| i)
            .collect();
        let entry = match entries.as_slice() {
            [] => return Err(GraphError::MissingEntry),
            [single] => *single,
            _ => {
                return Err(GraphError::MultipleEntries(
                    entries
                        .iter()
                        .map(|i| definition.nodes[*i].id.clone())
                        .collect(),
                ))
            }
        };

        let mut graph = Self {
            definition,
            index,
            outgoing,
            incoming,
            entry,
            plan: None,
        };

        graph.check_reachability()?;
        graph.check_edges()?;
        for node in &graph.definition.nodes {
            graph.check_node(node)?;
        }

        if graph.definition.metadata.strategy == Some(Strategy::Staged) {
            graph.plan = Some(StagePlan::build(
                graph.entry().id.as_str(),
                &graph.definition.nodes,
                &graph.definition.edges,
            )?);
        }

        log::debug!(
            "Validated flow '{}' ({} nodes, {} edges)",
            graph.id(),
            graph.definition.nodes.len(),
            graph.definition.edges.len()
        );
        Ok(graph)
    }

    fn check_reachability(&self) -> Result<(), GraphError> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue = VecDeque::from([self.entry().id.as_str()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            for edge in self.outgoing(id) {
                queue.push_back(edge.target.as_str());
            }
        }

        match self
            .definition
            .nodes
            .iter()
            .find(|n| !n.node_type().is_terminal() && !seen.contains(n.id.as_str()))
        {
            Some(node) => Err(GraphError::Unreachable(node.id.clone())),
            None => Ok(()),
        }
    }

    fn check_edges(&self) -> Result<(), GraphError> {
        for edge in &self.definition.edges {
            match (&edge.condition, edge.kind) {
                (Some(condition), _) => {
                    parse(condition).map_err(|e| GraphError::expression(&edge.source, e))?;
                }
                (None, EdgeKind::Conditional) => {
                    return Err(GraphError::invalid(
                        &edge.source,
                        format!("conditional edge to '{}' has no condition", edge.target),
                    ))
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn check_node(&self, node: &NodeDefinition) -> Result<(), GraphError> {
        let node_type = node.node_type();
        if node_type.is_staged_only() && self.strategy_hint() != Some(Strategy::Staged) {
            return Err(GraphError::invalid(
                &node.id,
                format!("'{}' nodes require `strategy: staged`", node_type),
            ));
        }

        let template = |source: &str| {
            Template::parse(source)
                .map(|_| ())
                .map_err(|e| GraphError::expression(&node.id, e))
        };

        match &node.kind {
            NodeKind::Elicit(cfg) => {
                template(&cfg.prompt)?;
                if let Some(retry) = &cfg.retry_prompt {
                    template(retry)?;
                }
                if let Some(memory) = &cfg.memory {
                    template(&memory.identity)?;
                    if cfg.variable.is_none() {
                        return Err(GraphError::invalid(
                            &node.id,
                            "memory lookup needs a target `variable`",
                        ));
                    }
                }
                if let Some(label) = &cfg.on_exhausted {
                    if self.edge_by_label(&node.id, label).is_none() {
                        return Err(GraphError::invalid(
                            &node.id,
                            format!("on_exhausted label '{}' has no edge", label),
                        ));
                    }
                }
                match &cfg.validator {
                    Validator::Pattern { regex } => {
                        regex::Regex::new(regex).map_err(|e| {
                            GraphError::invalid(&node.id, format!("bad pattern: {}", e))
                        })?;
                    }
                    Validator::Exact { values, .. } if values.is_empty() => {
                        return Err(GraphError::invalid(&node.id, "exact validator has no values"))
                    }
                    Validator::Classify { labels, .. } if labels.is_empty() => {
                        return Err(GraphError::invalid(&node.id, "classify validator has no labels"))
                    }
                    Validator::Extract {
                        instructions: Some(text),
                        ..
                    }
                    | Validator::Classify {
                        instructions: Some(text),
                        ..
                    } => template(text)?,
                    _ => {}
                }
            }
            NodeKind::ToolCall(cfg) => check_parameters(&cfg.parameters, &template)?,
            NodeKind::Llm(cfg) => template(&cfg.instructions)?,
            NodeKind::Transfer(cfg) => {
                template(&cfg.destination)?;
                for text in cfg.reason.iter().chain(cfg.message.iter()) {
                    template(text)?;
                }
            }
            NodeKind::End(cfg) => {
                if let Some(text) = &cfg.message {
                    template(text)?;
                }
            }
            NodeKind::Wait(cfg) => {
                if let Some(text) = &cfg.message {
                    template(text)?;
                }
                if cfg.timeout_secs.is_some_and(|secs| secs > MAX_WAIT_SECS) {
                    return Err(GraphError::invalid(
                        &node.id,
                        format!("timeout_secs may not exceed {}", MAX_WAIT_SECS),
                    ));
                }
            }
            NodeKind::FanIn(cfg) => {
                let arrivals = self.incoming(&node.id).count();
                match cfg.wait_for {
                    WaitMode::Count => match cfg.count {
                        Some(n) if n >= 1 && n <= arrivals => {}
                        _ => {
                            return Err(GraphError::invalid(
                                &node.id,
                                format!("join count must be between 1 and {}", arrivals),
                            ))
                        }
                    },
                    WaitMode::Nodes => {
                        if cfg.nodes.is_empty() {
                            return Err(GraphError::invalid(&node.id, "join lists no nodes"));
                        }
                        if let Some(missing) = cfg
                            .nodes
                            .iter()
                            .find(|n| !self.incoming(&node.id).any(|e| &e.source == *n))
                        {
                            return Err(GraphError::invalid(
                                &node.id,
                                format!("join waits for '{}' which has no edge here", missing),
                            ));
                        }
                    }
                    WaitMode::All | WaitMode::Any => {}
                }
            }
            NodeKind::Entry(_) | NodeKind::Decision(_) | NodeKind::FanOut(_) => {}
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    pub fn metadata(&self) -> &FlowMetadata {
        &self.definition.metadata
    }

    pub fn strategy_hint(&self) -> Option<Strategy> {
        self.definition.metadata.strategy
    }

    pub fn entry(&self) -> &NodeDefinition {
        &self.definition.nodes[self.entry]
    }

    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.index.get(id).map(|i| &self.definition.nodes[*i])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.definition.nodes.iter()
    }

    /// Outgoing edges in declaration order
    pub fn outgoing(&self, id: &str) -> impl Iterator<Item = &EdgeDefinition> {
        self.edges_at(self.outgoing.get(id))
    }

    /// Incoming edges in declaration order
    pub fn incoming(&self, id: &str) -> impl Iterator<Item = &EdgeDefinition> {
        self.edges_at(self.incoming.get(id))
    }

    fn edges_at<'a>(
        &'a self,
        indices: Option<&'a Vec<usize>>,
    ) -> impl Iterator<Item = &'a EdgeDefinition> + 'a {
        indices
            .into_iter()
            .flatten()
            .map(move |i| &self.definition.edges[*i])
    }

    /// Conditional/exclusive edges, higher priority first then declaration order
    pub fn guarded_edges(&self, id: &str) -> Vec<&EdgeDefinition> {
        let mut edges: Vec<&EdgeDefinition> =
            self.outgoing(id).filter(|e| e.is_guarded()).collect();
        // stable sort keeps declaration order within a priority
        edges.sort_by(|a, b| b.priority.cmp(&a.priority));
        edges
    }

    /// Unlabeled default edges; auto-advance needs exactly one
    pub fn plain_default_edges(&self, id: &str) -> Vec<&EdgeDefinition> {
        self.outgoing(id).filter(|e| e.is_plain_default()).collect()
    }

    /// Outgoing edge carrying a label
    pub fn edge_by_label(&self, id: &str, label: &str) -> Option<&EdgeDefinition> {
        self.outgoing(id)
            .find(|e| e.label.as_deref() == Some(label))
    }

    pub fn edge_of_kind(&self, id: &str, kind: EdgeKind) -> Option<&EdgeDefinition> {
        self.outgoing(id).find(|e| e.kind == kind)
    }

    /// Labels a node can route to
    pub fn labels(&self, id: &str) -> Vec<&str> {
        self.outgoing(id).filter_map(|e| e.label.as_deref()).collect()
    }

    /// Exclusive groups the edges `from -> target` belong to
    pub fn exclusive_groups(&self, from: &str, target: &str) -> Vec<String> {
        let mut groups: Vec<String> = self
            .outgoing(from)
            .filter(|e| e.target == target)
            .filter_map(|e| e.exclusive_group())
            .collect();
        groups.dedup();
        groups
    }

    /// Stage plan, present for staged flows
    pub fn plan(&self) -> Option<&StagePlan> {
        self.plan.as_ref()
    }
}

fn check_parameters<F>(value: &serde_json::Value, template: &F) -> Result<(), GraphError>
where
    F: Fn(&str) -> Result<(), GraphError>,
{
    match value {
        serde_json::Value::String(s) => template(s),
        serde_json::Value::Array(items) => items.iter().try_for_each(|v| check_parameters(v, template)),
        serde_json::Value::Object(map) => map.values().try_for_each(|v| check_parameters(v, template)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(yaml: &str) -> Result<FlowGraph, GraphError> {
        let def: FlowDefinition = serde_yaml::from_str(yaml).unwrap();
        FlowGraph::new(def)
    }

    const DECISION_FLOW: &str = r#"
id: decide
nodes:
  - id: start
    type: entry
  - id: check
    type: decision
  - id: a
    type: end
  - id: b
    type: end
edges:
  - { source: start, target: check }
  - { source: check, target: a, kind: exclusive, condition: "x > 0" }
  - { source: check, target: b, kind: exclusive, condition: "x <= 0", priority: 5 }
"#;

    #[test]
    fn test_valid_flow() {
        let g = graph(DECISION_FLOW).unwrap();
        assert_eq!(g.id(), "decide");
        assert_eq!(g.entry().id, "start");
        assert_eq!(g.outgoing("check").count(), 2);
        assert!(g.plan().is_none());
    }

    #[test]
    fn test_guarded_edges_priority_order() {
        let g = graph(DECISION_FLOW).unwrap();
        let targets: Vec<&str> = g
            .guarded_edges("check")
            .iter()
            .map(|e| e.target.as_str())
            .collect();
        assert_eq!(targets, vec!["b", "a"]);
    }

    #[test]
    fn test_exclusive_groups() {
        let g = graph(DECISION_FLOW).unwrap();
        assert_eq!(g.exclusive_groups("check", "a"), vec!["check:exclusive"]);
        assert_eq!(g.exclusive_groups("check", "b"), vec!["check:exclusive"]);
        assert!(g.exclusive_groups("start", "check").is_empty());
    }

    #[test]
    fn test_duplicate_node() {
        let err = graph(
            r#"
id: dup
nodes:
  - { id: start, type: entry }
  - { id: start, type: end }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateNode(ref id) if id == "start"));
    }

    #[test]
    fn test_dangling_edge() {
        let err = graph(
            r#"
id: dangling
nodes:
  - { id: start, type: entry }
edges:
  - { source: start, target: nowhere }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::DanglingEdge { ref missing, .. } if missing == "nowhere"));
    }

    #[test]
    fn test_entry_count() {
        let err = graph("id: none\nnodes:\n  - { id: done, type: end }\n").unwrap_err();
        assert!(matches!(err, GraphError::MissingEntry));

        let err = graph(
            "id: two\nnodes:\n  - { id: a, type: entry }\n  - { id: b, type: entry }\n",
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::MultipleEntries(_)));
    }

    #[test]
    fn test_unreachable_node() {
        let err = graph(
            r#"
id: island
nodes:
  - { id: start, type: entry }
  - { id: lost, type: decision }
  - { id: done, type: end }
edges:
  - { source: start, target: done }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::Unreachable(ref id) if id == "lost"));
    }

    #[test]
    fn test_bad_condition_rejected_at_load() {
        let err = graph(
            r#"
id: bad
nodes:
  - { id: start, type: entry }
  - { id: done, type: end }
edges:
  - { source: start, target: done, kind: conditional, condition: "x = 1" }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::InvalidExpression { .. }));
    }

    #[test]
    fn test_bad_regex_and_template_rejected() {
        let err = graph(
            r#"
id: bad_regex
nodes:
  - { id: start, type: entry }
  - id: ask
    type: elicit
    prompt: "Code?"
    validator: { kind: pattern, regex: "([a-z" }
  - { id: done, type: end }
edges:
  - { source: start, target: ask }
  - { source: ask, target: done }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::InvalidNode { .. }));

        let err = graph(
            r#"
id: bad_template
nodes:
  - { id: start, type: entry }
  - { id: done, type: end, message: "Bye {{name" }
edges:
  - { source: start, target: done }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::InvalidExpression { .. }));
    }

    #[test]
    fn test_wait_timeout_is_bounded() {
        let flow = |secs: u64| {
            format!(
                "id: wait\nnodes:\n  - {{ id: start, type: entry }}\n  - {{ id: pay, type: wait, event: paid, timeout_secs: {} }}\nedges:\n  - {{ source: start, target: pay }}\n",
                secs
            )
        };
        assert!(graph(&flow(MAX_WAIT_SECS)).is_ok());
        let err = graph(&flow(u64::MAX)).unwrap_err();
        assert!(matches!(err, GraphError::InvalidNode { ref node_id, .. } if node_id == "pay"));
    }

    #[test]
    fn test_fan_nodes_require_staged() {
        let err = graph(
            r#"
id: fan
nodes:
  - { id: start, type: entry }
  - { id: split, type: fan_out }
  - { id: done, type: end }
edges:
  - { source: start, target: split }
  - { source: split, target: done }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::InvalidNode { ref node_id, .. } if node_id == "split"));
    }

    #[test]
    fn test_cycles_allowed_sequential_rejected_staged() {
        let cyclic = r#"
id: loop
metadata: { strategy: STRATEGY }
nodes:
  - { id: start, type: entry }
  - { id: ask, type: elicit, prompt: "Again?" }
  - { id: check, type: decision }
  - { id: done, type: end }
edges:
  - { source: start, target: ask }
  - { source: ask, target: check }
  - { source: check, target: ask, kind: conditional, condition: "again == true" }
  - { source: check, target: done }
"#;
        assert!(graph(&cyclic.replace("STRATEGY", "sequential")).is_ok());
        let err = graph(&cyclic.replace("STRATEGY", "staged")).unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
    }
}
