// SPDX-License-Identifier: MIT

//! Elicit: ask, suspend, validate the answer, retry within a bound

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{user_turn, NodeContext, NodeExecutor, NodeOutcome};
use crate::adk::memory::MemoryService;
use crate::adk::model::Message;
use crate::parley::config::LowConfidencePolicy;
use crate::parley::error::ParleyError;
use crate::parley::flow::graph::{
    EdgeKind, ElicitConfig, MemoryLookup, NodeDefinition, NodeKind, NodeType, Validator,
};
use crate::parley::flow::state::{Delta, SessionStatus};

/// An accepted answer
#[derive(Debug, Clone, PartialEq)]
struct Accepted {
    value: Value,
    /// Classified intent; routes by label
    label: Option<String>,
}

pub struct ElicitExecutor;

impl ElicitExecutor {
    /// Memory first; otherwise render the prompt and suspend
    async fn ask(
        &self,
        node: &NodeDefinition,
        cfg: &ElicitConfig,
        cx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, ParleyError> {
        let mut delta = Delta::for_node(&node.id);

        if let (Some(lookup), Some(memory), Some(variable)) =
            (&cfg.memory, &cx.services.memory, &cfg.variable)
        {
            let identity = cx.render(&lookup.identity)?;
            let handle = memory
                .get_or_create(&identity)
                .await
                .map_err(|e| ParleyError::collaborator(&node.id, e))?;
            let known = memory
                .retrieve(&handle, &lookup.key)
                .await
                .map_err(|e| ParleyError::collaborator(&node.id, e))?;
            if let Some(value) = known {
                log::info!(
                    "[{}] '{}' already known for '{}', skipping question",
                    cx.session_id,
                    lookup.key,
                    node.id
                );
                delta.set_var(variable, value);
                return Ok(NodeOutcome::advance(delta));
            }
        }

        delta
            .say(cx.render(&cfg.prompt)?)
            .await_input(&node.id, None)
            .set_status(SessionStatus::Waiting);
        Ok(NodeOutcome::waiting(delta))
    }

    /// Validate the answer the session was waiting for
    async fn answer(
        &self,
        node: &NodeDefinition,
        cfg: &ElicitConfig,
        cx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, ParleyError> {
        let mut delta = Delta::for_node(&node.id);
        delta.clear_await();

        let text = cx.input_text().unwrap_or("").trim().to_string();
        if !text.is_empty() {
            user_turn(&mut delta, &node.id, &text);
        }

        match self.validate(node, cfg, &text, cx).await? {
            Ok(accepted) => {
                let variable = cfg.variable.as_deref().unwrap_or(&node.id);
                delta
                    .set_var(variable, accepted.value.clone())
                    .set_attempts(&node.id, 0);
                self.remember(node, cfg, &accepted.value, cx).await;
                Ok(match accepted.label {
                    Some(label) => NodeOutcome::label(delta, label),
                    None => NodeOutcome::advance(delta),
                })
            }
            Err(reason) => {
                let attempts = cx.state.attempts(&node.id) + 1;
                log::info!(
                    "[{}] '{}' rejected answer ({}/{}): {}",
                    cx.session_id,
                    node.id,
                    attempts,
                    cfg.max_retries + 1,
                    reason
                );

                if attempts > cfg.max_retries {
                    delta.set_attempts(&node.id, 0);
                    if let Some(label) = &cfg.on_exhausted {
                        return Ok(NodeOutcome::label(delta, label.clone()));
                    }
                    if let Some(edge) = cx.graph.edge_of_kind(&node.id, EdgeKind::Error) {
                        delta.route(vec![edge.target.clone()], edge.label.clone());
                        return Ok(NodeOutcome::targets(delta, vec![edge.target.clone()]));
                    }
                    return Err(ParleyError::validation(
                        &node.id,
                        format!("retries exhausted after {} attempts: {}", attempts, reason),
                    ));
                }

                let prompt = cfg.retry_prompt.as_deref().unwrap_or(&cfg.prompt);
                delta
                    .set_attempts(&node.id, attempts)
                    .say(cx.render(prompt)?)
                    .await_input(&node.id, None)
                    .set_status(SessionStatus::Waiting);
                Ok(NodeOutcome::waiting(delta))
            }
        }
    }

    /// Outer error is fatal; inner error is a rejected answer
    async fn validate(
        &self,
        node: &NodeDefinition,
        cfg: &ElicitConfig,
        text: &str,
        cx: &NodeContext<'_>,
    ) -> Result<Result<Accepted, String>, ParleyError> {
        if text.is_empty() {
            return Ok(Err("empty answer".to_string()));
        }

        let plain = |value: &str| Accepted {
            value: Value::String(value.to_string()),
            label: None,
        };

        Ok(match &cfg.validator {
            Validator::Any => Ok(plain(text)),
            Validator::Exact {
                values,
                case_sensitive,
            } => values
                .iter()
                .find(|v| {
                    if *case_sensitive {
                        v.as_str() == text
                    } else {
                        v.eq_ignore_ascii_case(text)
                    }
                })
                .map(|v| plain(v))
                .ok_or_else(|| format!("'{}' is not one of {:?}", text, values)),
            Validator::Pattern { regex } => {
                let re = regex::Regex::new(regex)
                    .map_err(|e| ParleyError::validation(&node.id, e.to_string()))?;
                if re.is_match(text) {
                    Ok(plain(text))
                } else {
                    Err(format!("'{}' does not match the expected format", text))
                }
            }
            Validator::Extract {
                schema,
                instructions,
                min_confidence,
            } => {
                self.extract(node, text, schema, instructions.as_deref(), *min_confidence, cx)
                    .await?
            }
            Validator::Classify {
                labels,
                instructions,
            } => self.classify(node, text, labels, instructions.as_deref(), cx).await?,
        })
    }

    async fn extract(
        &self,
        node: &NodeDefinition,
        text: &str,
        schema: &Value,
        instructions: Option<&str>,
        min_confidence: Option<f64>,
        cx: &NodeContext<'_>,
    ) -> Result<Result<Accepted, String>, ParleyError> {
        let system = match instructions {
            Some(t) => cx.render(t)?,
            None => "Extract the requested information from the user's answer. \
                     Include a `confidence` between 0 and 1."
                .to_string(),
        };
        let messages = [Message::system(system), Message::user(text)];
        let response = cx.services.respond(&node.id, &messages, Some(schema)).await?;

        let Some(mut data) = response.structured else {
            return Ok(Err("model returned no structured data".to_string()));
        };
        if let Value::Object(map) = &mut data {
            map.remove("confidence");
        }

        let extraction = &cx.services.config.extraction;
        if let Some(min) = min_confidence.or(extraction.min_confidence) {
            let confidence = response.confidence.unwrap_or(0.0);
            if confidence < min {
                match extraction.low_confidence {
                    LowConfidencePolicy::Retry => {
                        return Ok(Err(format!(
                            "extraction confidence {:.2} below {:.2}",
                            confidence, min
                        )))
                    }
                    LowConfidencePolicy::Accept => log::warn!(
                        "[{}] Accepting low-confidence extraction at '{}' ({:.2} < {:.2})",
                        cx.session_id,
                        node.id,
                        confidence,
                        min
                    ),
                }
            }
        }

        Ok(Ok(Accepted {
            value: data,
            label: None,
        }))
    }

    async fn classify(
        &self,
        node: &NodeDefinition,
        text: &str,
        labels: &[String],
        instructions: Option<&str>,
        cx: &NodeContext<'_>,
    ) -> Result<Result<Accepted, String>, ParleyError> {
        let accept = |label: &str| Accepted {
            value: Value::String(label.to_string()),
            label: Some(label.to_string()),
        };

        // A literal answer needs no model
        if let Some(label) = labels.iter().find(|l| l.eq_ignore_ascii_case(text)) {
            return Ok(Ok(accept(label)));
        }
        if cx.services.model.is_none() {
            return Ok(Err(format!("'{}' is not one of {:?}", text, labels)));
        }

        let system = match instructions {
            Some(t) => cx.render(t)?,
            None => format!(
                "Classify the user's answer into exactly one of: {}.",
                labels.join(", ")
            ),
        };
        let schema = json!({
            "type": "object",
            "properties": {"label": {"type": "string", "enum": labels}},
            "required": ["label"],
            "additionalProperties": false
        });
        let messages = [Message::system(system), Message::user(text)];
        let response = cx.services.respond(&node.id, &messages, Some(&schema)).await?;

        let chosen = response
            .structured
            .as_ref()
            .and_then(|s| s.get("label"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(response.content.map(|c| c.trim().to_string()));
        Ok(match chosen {
            Some(c) => match labels.iter().find(|l| l.eq_ignore_ascii_case(&c)) {
                Some(label) => Ok(accept(label)),
                None => Err(format!("classified as unknown label '{}'", c)),
            },
            None => Err("model gave no label".to_string()),
        })
    }

    /// Best effort: a failed memory write does not fail the turn
    async fn remember(
        &self,
        node: &NodeDefinition,
        cfg: &ElicitConfig,
        value: &Value,
        cx: &NodeContext<'_>,
    ) {
        let (Some(lookup), Some(memory)) = (&cfg.memory, &cx.services.memory) else {
            return;
        };
        if let Err(e) = store_in_memory(memory.as_ref(), lookup, value, cx).await {
            log::warn!(
                "[{}] Could not remember '{}' from '{}': {}",
                cx.session_id,
                lookup.key,
                node.id,
                e
            );
        }
    }
}

async fn store_in_memory(
    memory: &dyn MemoryService,
    lookup: &MemoryLookup,
    value: &Value,
    cx: &NodeContext<'_>,
) -> Result<(), ParleyError> {
    let identity = cx.render(&lookup.identity)?;
    let handle = memory
        .get_or_create(&identity)
        .await
        .map_err(|e| ParleyError::collaborator("memory", e))?;
    memory
        .store(&handle, &lookup.key, value.clone())
        .await
        .map_err(|e| ParleyError::collaborator("memory", e))
}

#[async_trait]
impl NodeExecutor for ElicitExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Elicit
    }

    fn routes_dynamically(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        cx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, ParleyError> {
        let NodeKind::Elicit(cfg) = &node.kind else {
            return Err(ParleyError::NoExecutor(node.node_type()));
        };

        if cx.is_resuming(&node.id) {
            self.answer(node, cfg, cx).await
        } else {
            self.ask(node, cfg, cx).await
        }
    }
}
