// SPDX-License-Identifier: MIT

use async_trait::async_trait;

use super::{NodeContext, NodeExecutor, NodeOutcome};
use crate::parley::error::ParleyError;
use crate::parley::flow::condition;
use crate::parley::flow::graph::{NodeDefinition, NodeType};
use crate::parley::flow::state::Delta;

/// Routes on the first true edge condition
///
/// Guarded edges are tried by priority, then declaration order. When none
/// matches, the single unconditioned default edge is taken.
pub struct DecisionExecutor;

#[async_trait]
impl NodeExecutor for DecisionExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Decision
    }

    fn routes_dynamically(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        cx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, ParleyError> {
        let mut delta = Delta::for_node(&node.id);

        for edge in cx.graph.guarded_edges(&node.id) {
            let Some(source) = &edge.condition else {
                continue;
            };
            if condition::check(source, cx.vars())? {
                log::debug!(
                    "[{}] Decision '{}' matched '{}' -> {}",
                    cx.session_id,
                    node.id,
                    source,
                    edge.target
                );
                delta.route(vec![edge.target.clone()], edge.label.clone());
                return Ok(NodeOutcome::targets(delta, vec![edge.target.clone()]));
            }
        }

        let defaults = cx.graph.plain_default_edges(&node.id);
        match defaults.as_slice() {
            [edge] => {
                delta.route(vec![edge.target.clone()], None);
                Ok(NodeOutcome::targets(delta, vec![edge.target.clone()]))
            }
            [] => Err(ParleyError::routing(
                &node.id,
                "no condition matched and there is no default edge",
            )),
            _ => Err(ParleyError::routing(
                &node.id,
                "no condition matched and the default edge is ambiguous",
            )),
        }
    }
}
