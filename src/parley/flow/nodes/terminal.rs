// SPDX-License-Identifier: MIT

use async_trait::async_trait;

use super::{NodeContext, NodeExecutor, NodeOutcome};
use crate::parley::error::ParleyError;
use crate::parley::flow::graph::{NodeDefinition, NodeKind, NodeType};
use crate::parley::flow::state::{Delta, Handoff, SessionStatus};

/// Closes the conversation
pub struct EndExecutor;

#[async_trait]
impl NodeExecutor for EndExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::End
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        cx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, ParleyError> {
        let NodeKind::End(cfg) = &node.kind else {
            return Err(ParleyError::NoExecutor(node.node_type()));
        };

        let mut delta = Delta::for_node(&node.id);
        if let Some(message) = &cfg.message {
            delta.say(cx.render(message)?);
        }
        delta.set_status(SessionStatus::Completed);
        Ok(NodeOutcome::hold(delta))
    }
}

/// Hands the caller over to a person or another system
pub struct TransferExecutor;

#[async_trait]
impl NodeExecutor for TransferExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Transfer
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        cx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, ParleyError> {
        let NodeKind::Transfer(cfg) = &node.kind else {
            return Err(ParleyError::NoExecutor(node.node_type()));
        };

        let destination = cx.render(&cfg.destination)?;
        let reason = cfg.reason.as_deref().map(|r| cx.render(r)).transpose()?;
        log::info!(
            "[{}] Transferring to '{}' from '{}'",
            cx.session_id,
            destination,
            node.id
        );

        let mut delta = Delta::for_node(&node.id);
        if let Some(message) = &cfg.message {
            delta.say(cx.render(message)?);
        }
        delta
            .handoff(Handoff {
                destination,
                reason,
            })
            .set_status(SessionStatus::Completed);
        Ok(NodeOutcome::hold(delta))
    }
}
