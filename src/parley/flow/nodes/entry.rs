// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use serde_json::Value;

use super::{user_turn, NodeContext, NodeExecutor, NodeOutcome};
use crate::parley::error::ParleyError;
use crate::parley::flow::graph::{NodeDefinition, NodeKind, NodeType};
use crate::parley::flow::state::Delta;

/// Seeds the session variables and moves on
pub struct EntryExecutor;

#[async_trait]
impl NodeExecutor for EntryExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Entry
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        cx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, ParleyError> {
        let NodeKind::Entry(cfg) = &node.kind else {
            return Err(ParleyError::NoExecutor(node.node_type()));
        };

        let mut delta = Delta::for_node(&node.id);
        for (key, value) in &cfg.defaults {
            delta.set_var(key, value.clone());
        }

        if let Some(input) = cx.input {
            match &input.payload {
                Some(Value::Object(fields)) => {
                    for (key, value) in fields {
                        delta.set_var(key, value.clone());
                    }
                }
                Some(other) => {
                    log::warn!(
                        "[{}] Ignoring non-object start payload: {}",
                        cx.session_id,
                        other
                    );
                }
                None => {}
            }
            if let Some(text) = &input.text {
                user_turn(&mut delta, &node.id, text);
            }
        }

        Ok(NodeOutcome::advance(delta))
    }
}
