// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use serde_json::Value;

use super::{NodeContext, NodeExecutor, NodeOutcome};
use crate::adk::model::Message;
use crate::parley::error::ParleyError;
use crate::parley::flow::graph::{NodeDefinition, NodeKind, NodeType};
use crate::parley::flow::state::Delta;

/// Structured field a model can use to pick the next edge
const ACTION_FIELD: &str = "action";

/// Asks the language model and stores its answer
///
/// With an output schema the structured result is stored; otherwise the text.
/// The model may route by returning an outgoing label, either as the
/// `action` field of a structured answer or as its whole text answer.
pub struct LlmExecutor;

#[async_trait]
impl NodeExecutor for LlmExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Llm
    }

    fn routes_dynamically(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        cx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, ParleyError> {
        let NodeKind::Llm(cfg) = &node.kind else {
            return Err(ParleyError::NoExecutor(node.node_type()));
        };

        let mut messages = vec![Message::system(cx.render(&cfg.instructions)?)];
        if cfg.include_history {
            messages.extend(cx.history_messages());
        }

        let response = cx
            .services
            .respond(&node.id, &messages, cfg.output_schema.as_ref())
            .await?;

        let mut delta = Delta::for_node(&node.id);
        let output_variable = cfg
            .output_variable
            .clone()
            .unwrap_or_else(|| format!("{}_output", node.id));

        let stored = match (&response.structured, &response.content) {
            (Some(data), _) => data.clone(),
            (None, Some(text)) => Value::String(text.clone()),
            (None, None) => Value::Null,
        };
        delta.set_var(output_variable, stored);

        if cfg.speak {
            if let Some(text) = response.content.as_deref().filter(|t| !t.trim().is_empty()) {
                delta.say(text);
            }
        }

        let action = response
            .structured
            .as_ref()
            .and_then(|data| data.get(ACTION_FIELD))
            .and_then(Value::as_str);
        if let Some(label) = action {
            if cx.graph.edge_by_label(&node.id, label).is_none() {
                return Err(ParleyError::routing(
                    &node.id,
                    format!("model chose unknown action '{}'", label),
                ));
            }
            return Ok(NodeOutcome::label(delta, label));
        }

        if let Some(text) = response.content.as_deref().map(str::trim) {
            if cx.graph.edge_by_label(&node.id, text).is_some() {
                return Ok(NodeOutcome::label(delta, text));
            }
        }

        Ok(NodeOutcome::advance(delta))
    }
}
