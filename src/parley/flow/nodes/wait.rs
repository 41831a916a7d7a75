// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use chrono::Duration;
use serde_json::Value;

use super::{user_turn, NodeContext, NodeExecutor, NodeOutcome};
use crate::parley::error::ParleyError;
use crate::parley::flow::graph::{EdgeKind, NodeDefinition, NodeKind, NodeType, WaitConfig};
use crate::parley::flow::state::{Delta, SessionStatus};

/// Suspends until an external event arrives or the deadline passes
///
/// The first visit records the deadline and parks the session. A later
/// `advance` either carries the awaited event (stored, then advance), the
/// reserved `timeout` event or arrives past the deadline (timeout edge or
/// a timed-out session), or is some other event, which leaves it parked.
pub struct WaitExecutor;

impl WaitExecutor {
    fn park(&self, node: &NodeDefinition, cfg: &WaitConfig, cx: &NodeContext<'_>) -> Result<NodeOutcome, ParleyError> {
        let deadline = match cfg.timeout_secs {
            Some(secs) => Some(
                i64::try_from(secs)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .and_then(|d| cx.now.checked_add_signed(d))
                    .ok_or_else(|| {
                        ParleyError::Config(format!(
                            "wait '{}': timeout_secs {} is out of range",
                            node.id, secs
                        ))
                    })?,
            ),
            None => None,
        };

        let mut delta = Delta::for_node(&node.id);
        if let Some(message) = &cfg.message {
            delta.say(cx.render(message)?);
        }
        delta
            .await_input(&node.id, deadline)
            .set_status(SessionStatus::Waiting);
        Ok(NodeOutcome::waiting(delta))
    }

    fn expire(&self, node: &NodeDefinition, cx: &NodeContext<'_>) -> NodeOutcome {
        let mut delta = Delta::for_node(&node.id);
        delta.clear_await();
        match cx.graph.edge_of_kind(&node.id, EdgeKind::Timeout) {
            Some(edge) => {
                log::info!("[{}] Wait '{}' timed out, following timeout edge", cx.session_id, node.id);
                delta.route(vec![edge.target.clone()], edge.label.clone());
                NodeOutcome::targets(delta, vec![edge.target.clone()])
            }
            None => {
                log::info!("[{}] Wait '{}' timed out", cx.session_id, node.id);
                delta.set_status(SessionStatus::Timeout);
                NodeOutcome::hold(delta)
            }
        }
    }
}

#[async_trait]
impl NodeExecutor for WaitExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Wait
    }

    fn routes_dynamically(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        cx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, ParleyError> {
        let NodeKind::Wait(cfg) = &node.kind else {
            return Err(ParleyError::NoExecutor(node.node_type()));
        };

        if !cx.is_resuming(&node.id) {
            return self.park(node, cfg, cx);
        }

        let expired = cx
            .state
            .awaiting()
            .and_then(|a| a.deadline)
            .is_some_and(|deadline| cx.now >= deadline);
        let input = cx.input;
        if expired || input.is_some_and(|i| i.is_timeout()) {
            return Ok(self.expire(node, cx));
        }

        let Some(input) = input else {
            return Ok(NodeOutcome::waiting(Delta::for_node(&node.id)));
        };

        let matches = match (&cfg.event, &input.event) {
            (Some(wanted), Some(got)) => wanted == got,
            (Some(_), None) => false,
            (None, _) => true,
        };
        if !matches {
            log::debug!(
                "[{}] Wait '{}' ignoring event {:?}",
                cx.session_id,
                node.id,
                input.event
            );
            let mut delta = Delta::for_node(&node.id);
            delta.set_status(SessionStatus::Waiting);
            return Ok(NodeOutcome::waiting(delta));
        }

        let mut delta = Delta::for_node(&node.id);
        delta.clear_await();
        if let Some(text) = &input.text {
            user_turn(&mut delta, &node.id, text);
        }
        let value = input
            .payload
            .clone()
            .or_else(|| input.text.clone().map(Value::String))
            .unwrap_or(Value::Null);
        let key = cfg.output_variable.clone().unwrap_or_else(|| node.id.clone());
        delta.set_var(key, value);
        Ok(NodeOutcome::advance(delta))
    }
}
