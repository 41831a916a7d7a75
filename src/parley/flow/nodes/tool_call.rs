// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::{NodeContext, NodeExecutor, NodeOutcome};
use crate::adk::error::{CollaboratorError, ToolError};
use crate::parley::error::ParleyError;
use crate::parley::flow::graph::{EdgeKind, NodeDefinition, NodeKind, NodeType, ToolCallConfig};
use crate::parley::flow::state::Delta;

/// Edge label taken after a successful call, when declared
const SUCCESS_LABEL: &str = "success";

/// Calls a tool with interpolated parameters
pub struct ToolCallExecutor;

impl ToolCallExecutor {
    async fn call(
        &self,
        node: &NodeDefinition,
        cfg: &ToolCallConfig,
        cx: &NodeContext<'_>,
    ) -> Result<Result<Value, CollaboratorError>, ParleyError> {
        let parameters = cx.resolve(&cfg.parameters)?;
        let secs = cfg
            .timeout_secs
            .unwrap_or(cx.services.config.tool_timeout_secs);
        let context = cx.tool_context(&node.id);

        log::info!(
            "[{}] Calling tool '{}' from '{}'",
            cx.session_id,
            cfg.tool,
            node.id
        );
        let call = cx.services.tools.execute(&cfg.tool, parameters, &context);
        Ok(match tokio::time::timeout(Duration::from_secs(secs), call).await {
            Ok(result) if result.success => Ok(result.output),
            Ok(result) => Err(ToolError::failed(
                &cfg.tool,
                result.error.unwrap_or_else(|| "unknown error".to_string()),
            )
            .into()),
            Err(_) => Err(CollaboratorError::timeout(
                format!("tool '{}'", cfg.tool),
                secs,
            )),
        })
    }
}

#[async_trait]
impl NodeExecutor for ToolCallExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::ToolCall
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        cx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, ParleyError> {
        let NodeKind::ToolCall(cfg) = &node.kind else {
            return Err(ParleyError::NoExecutor(node.node_type()));
        };

        let mut delta = Delta::for_node(&node.id);
        let output_variable = cfg
            .output_variable
            .clone()
            .unwrap_or_else(|| format!("{}_result", node.id));

        match self.call(node, cfg, cx).await? {
            Ok(output) => {
                delta.set_var(output_variable, output);
                if cx.graph.edge_by_label(&node.id, SUCCESS_LABEL).is_some() {
                    Ok(NodeOutcome::label(delta, SUCCESS_LABEL))
                } else {
                    Ok(NodeOutcome::advance(delta))
                }
            }
            Err(err) => {
                let error_edge = cx.graph.edge_of_kind(&node.id, EdgeKind::Error);
                match (cfg.continue_on_error, error_edge) {
                    (true, Some(edge)) => {
                        log::warn!(
                            "[{}] Tool '{}' failed at '{}', following error edge: {}",
                            cx.session_id,
                            cfg.tool,
                            node.id,
                            err
                        );
                        delta
                            .set_var(format!("{}_error", node.id), Value::String(err.to_string()))
                            .route(vec![edge.target.clone()], edge.label.clone());
                        Ok(NodeOutcome::targets(delta, vec![edge.target.clone()]))
                    }
                    _ => Err(ParleyError::collaborator(&node.id, err)),
                }
            }
        }
    }
}
