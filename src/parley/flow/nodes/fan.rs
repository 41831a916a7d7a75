// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use std::collections::BTreeSet;

use super::{NodeContext, NodeExecutor, NodeOutcome};
use crate::parley::error::ParleyError;
use crate::parley::flow::graph::{EdgeKind, FanInConfig, NodeDefinition, NodeType, WaitMode};
use crate::parley::flow::state::Delta;

/// Opens parallel branches along its default and parallel edges
pub struct FanOutExecutor;

#[async_trait]
impl NodeExecutor for FanOutExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::FanOut
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        cx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, ParleyError> {
        let targets: Vec<String> = cx
            .graph
            .outgoing(&node.id)
            .filter(|e| matches!(e.kind, EdgeKind::Default | EdgeKind::Parallel))
            .map(|e| e.target.clone())
            .collect();
        if targets.is_empty() {
            return Err(ParleyError::routing(&node.id, "fan-out has no branches"));
        }
        log::debug!("[{}] Fan-out '{}' -> {:?}", cx.session_id, node.id, targets);
        Ok(NodeOutcome::targets(Delta::for_node(&node.id), targets))
    }
}

/// Joins branches; the scheduler only runs it once [`join_ready`] holds
pub struct FanInExecutor;

#[async_trait]
impl NodeExecutor for FanInExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::FanIn
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        _cx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, ParleyError> {
        Ok(NodeOutcome::advance(Delta::for_node(&node.id)))
    }
}

/// Whether a join has seen enough arrivals to run
///
/// `sources` are the nodes with an edge into the join.
pub fn join_ready(cfg: &FanInConfig, arrivals: Option<&BTreeSet<String>>, sources: &[&str]) -> bool {
    let empty = BTreeSet::new();
    let arrivals = arrivals.unwrap_or(&empty);
    match cfg.wait_for {
        WaitMode::All => sources.iter().all(|s| arrivals.contains(*s)),
        WaitMode::Any => !arrivals.is_empty(),
        WaitMode::Count => arrivals.len() >= cfg.count.unwrap_or(sources.len()),
        WaitMode::Nodes => cfg.nodes.iter().all(|n| arrivals.contains(n)),
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::Routing;
    use super::*;

    fn arrived(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_join_modes() {
        let sources = ["a", "b", "c"];
        let all = FanInConfig::default();
        assert!(!join_ready(&all, Some(&arrived(&["a", "b"])), &sources));
        assert!(join_ready(&all, Some(&arrived(&["a", "b", "c"])), &sources));
        assert!(!join_ready(&all, None, &sources));

        let any = FanInConfig {
            wait_for: WaitMode::Any,
            ..Default::default()
        };
        assert!(join_ready(&any, Some(&arrived(&["c"])), &sources));
        assert!(!join_ready(&any, None, &sources));

        let two = FanInConfig {
            wait_for: WaitMode::Count,
            count: Some(2),
            ..Default::default()
        };
        assert!(!join_ready(&two, Some(&arrived(&["a"])), &sources));
        assert!(join_ready(&two, Some(&arrived(&["a", "c"])), &sources));

        let named = FanInConfig {
            wait_for: WaitMode::Nodes,
            nodes: vec!["b".into()],
            ..Default::default()
        };
        assert!(join_ready(&named, Some(&arrived(&["b"])), &sources));
        assert!(!join_ready(&named, Some(&arrived(&["a", "c"])), &sources));
    }

    #[tokio::test]
    async fn test_fan_out_targets_every_branch() {
        let g = graph(
            r#"
id: fan
metadata: { strategy: staged }
nodes:
  - { id: start, type: entry }
  - { id: split, type: fan_out }
  - { id: a, type: decision }
  - { id: b, type: decision }
  - { id: join, type: fan_in }
  - { id: done, type: end }
edges:
  - { source: start, target: split }
  - { source: split, target: a, kind: parallel }
  - { source: split, target: b, kind: parallel }
  - { source: a, target: join }
  - { source: b, target: join }
  - { source: join, target: done }
"#,
        );
        let st = state(vec![]);
        let svc = services();
        let cx = context(&g, &st, &svc, None);
        let outcome = FanOutExecutor
            .execute(g.node("split").unwrap(), &cx)
            .await
            .unwrap();
        assert_eq!(outcome.routing, Routing::Targets(vec!["a".into(), "b".into()]));
    }
}
