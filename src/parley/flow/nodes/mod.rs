// SPDX-License-Identifier: MIT

//! Node executors
//!
//! Every node type has one executor implementing [`NodeExecutor`]. An
//! executor reads the (immutable) execution context and returns a
//! [`NodeOutcome`]: the delta it wants applied and where to go next. It never
//! mutates the context itself; the runners apply and persist the delta.

mod decision;
mod elicit;
mod entry;
mod fan;
mod llm;
mod terminal;
mod tool_call;
mod wait;

pub use decision::DecisionExecutor;
pub use elicit::ElicitExecutor;
pub use entry::EntryExecutor;
pub use fan::{join_ready, FanInExecutor, FanOutExecutor};
pub use llm::LlmExecutor;
pub use terminal::{EndExecutor, TransferExecutor};
pub use tool_call::ToolCallExecutor;
pub use wait::WaitExecutor;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::adk::error::{CollaboratorError, ModelError};
use crate::adk::memory::MemoryService;
use crate::adk::model::{LanguageModel, Message, ModelResponse, Role};
use crate::adk::tool::{ToolContext, ToolExecutor};
use crate::parley::config::EngineConfig;
use crate::parley::error::ParleyError;
use crate::parley::flow::condition::{self, Template};
use crate::parley::flow::graph::{FlowGraph, NodeDefinition, NodeType};
use crate::parley::flow::state::{Delta, ExecutionContext, Variables};

/// Event name reserved for deadline expiry
pub const TIMEOUT_EVENT: &str = "timeout";

/// What the outside world hands to `advance`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalInput {
    /// User speech or typing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Named external event, for wait nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    /// Structured data: start variables or event payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ExternalInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn event(name: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            event: Some(name.into()),
            payload,
            ..Default::default()
        }
    }

    pub fn payload(payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.event.as_deref() == Some(TIMEOUT_EVENT)
    }
}

/// Collaborators available to executors
#[derive(Clone)]
pub struct Services {
    pub tools: Arc<dyn ToolExecutor>,
    pub model: Option<Arc<dyn LanguageModel>>,
    pub memory: Option<Arc<dyn MemoryService>>,
    pub config: Arc<EngineConfig>,
}

impl Services {
    pub fn new(tools: Arc<dyn ToolExecutor>, config: Arc<EngineConfig>) -> Self {
        Self {
            tools,
            model: None,
            memory: None,
            config,
        }
    }

    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryService>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Call the model within `model_timeout_secs`
    pub async fn respond(
        &self,
        node_id: &str,
        messages: &[Message],
        schema: Option<&Value>,
    ) -> Result<ModelResponse, ParleyError> {
        let model = self.model.as_ref().ok_or_else(|| {
            ParleyError::collaborator(node_id, ModelError::api("none", "no language model configured"))
        })?;
        let secs = self.config.model_timeout_secs;
        match tokio::time::timeout(Duration::from_secs(secs), model.respond(messages, schema)).await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(ParleyError::collaborator(node_id, e)),
            Err(_) => Err(ParleyError::collaborator(
                node_id,
                CollaboratorError::timeout("language model", secs),
            )),
        }
    }
}

/// Everything an executor may read while running one node
pub struct NodeContext<'a> {
    pub session_id: &'a str,
    pub graph: &'a FlowGraph,
    pub state: &'a ExecutionContext,
    /// Present only when this node is the one consuming the caller's input
    pub input: Option<&'a ExternalInput>,
    pub services: &'a Services,
    pub now: DateTime<Utc>,
}

impl<'a> NodeContext<'a> {
    pub fn vars(&self) -> &Variables {
        self.state.variables()
    }

    /// Render a `{{expr}}` template against the session variables
    pub fn render(&self, template: &str) -> Result<String, ParleyError> {
        Ok(condition::interpolate(template, self.vars())?)
    }

    /// Resolve a config value: a string that is a single placeholder keeps the
    /// expression's JSON type, other strings are interpolated, containers recurse.
    pub fn resolve(&self, value: &Value) -> Result<Value, ParleyError> {
        Ok(match value {
            Value::String(s) => {
                let trimmed = s.trim();
                let single = trimmed.starts_with("{{")
                    && trimmed.ends_with("}}")
                    && trimmed[2..].find("{{").is_none();
                if single {
                    let expr = condition::parse(trimmed[2..trimmed.len() - 2].trim())?;
                    condition::evaluate(&expr, self.vars())?
                } else {
                    Value::String(Template::parse(s)?.render(self.vars())?)
                }
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.resolve(v))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.resolve(v)?)))
                    .collect::<Result<serde_json::Map<_, _>, ParleyError>>()?,
            ),
            other => other.clone(),
        })
    }

    pub fn tool_context(&self, node_id: &str) -> ToolContext {
        ToolContext {
            session_id: self.session_id.to_string(),
            flow_id: self.graph.id().to_string(),
            node_id: node_id.to_string(),
            variables: self.state.to_json(),
        }
    }

    /// Conversation history as model messages
    pub fn history_messages(&self) -> Vec<Message> {
        self.state
            .history()
            .iter()
            .map(|turn| Message {
                role: turn.role,
                content: turn.content.clone(),
            })
            .collect()
    }

    /// Text the user just sent, if any
    pub fn input_text(&self) -> Option<&str> {
        self.input.and_then(|i| i.text.as_deref())
    }

    /// True when the session is suspended on this node
    pub fn is_resuming(&self, node_id: &str) -> bool {
        self.state.is_awaiting(node_id)
    }
}

/// Coarse result of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Success,
    Waiting,
    Failed,
}

/// Where the runner should go next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Take the single unambiguous outgoing edge
    Advance,
    /// Take the outgoing edge with this label
    Label(String),
    /// Go to these nodes (several only in staged mode)
    Targets(Vec<String>),
    /// Stay put: waiting or terminal
    Hold,
}

/// Result of executing a node
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub status: OutcomeStatus,
    pub delta: Delta,
    pub routing: Routing,
}

impl NodeOutcome {
    pub fn advance(delta: Delta) -> Self {
        Self {
            status: OutcomeStatus::Success,
            delta,
            routing: Routing::Advance,
        }
    }

    pub fn label(delta: Delta, label: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Success,
            delta,
            routing: Routing::Label(label.into()),
        }
    }

    pub fn targets(delta: Delta, targets: Vec<String>) -> Self {
        Self {
            status: OutcomeStatus::Success,
            delta,
            routing: Routing::Targets(targets),
        }
    }

    /// Terminal outcome: done, nowhere to go
    pub fn hold(delta: Delta) -> Self {
        Self {
            status: OutcomeStatus::Success,
            delta,
            routing: Routing::Hold,
        }
    }

    pub fn waiting(delta: Delta) -> Self {
        Self {
            status: OutcomeStatus::Waiting,
            delta,
            routing: Routing::Hold,
        }
    }
}

/// Contract every node type implements
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Node type this executor handles
    fn node_type(&self) -> NodeType;

    /// True when the executor may choose a route at runtime
    fn routes_dynamically(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        node: &NodeDefinition,
        cx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, ParleyError>;
}

/// Record the user's reply in the history
pub(crate) fn user_turn(delta: &mut Delta, node_id: &str, text: &str) {
    delta.append_turn(Role::User, text, Some(node_id));
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use serde_json::json;

    const FLOW: &str = r#"
id: t
nodes:
  - { id: start, type: entry }
  - { id: done, type: end }
edges:
  - { source: start, target: done }
"#;

    #[test]
    fn test_resolve_keeps_types_for_single_placeholder() {
        let g = graph(FLOW);
        let st = state(vec![vars(&[
            ("plate", json!("B-XY 123")),
            ("count", json!(3)),
        ])]);
        let svc = services();
        let cx = context(&g, &st, &svc, None);

        let resolved = cx
            .resolve(&json!({
                "plate": "{{plate}}",
                "n": "{{ count }}",
                "note": "plate {{plate}} x{{count}}",
                "fixed": 7
            }))
            .unwrap();
        assert_eq!(
            resolved,
            json!({"plate": "B-XY 123", "n": 3, "note": "plate B-XY 123 x3", "fixed": 7})
        );
    }

    #[test]
    fn test_external_input_constructors() {
        assert!(ExternalInput::event(TIMEOUT_EVENT, None).is_timeout());
        assert!(!ExternalInput::text("hi").is_timeout());
        let json = serde_json::to_value(ExternalInput::text("hi")).unwrap();
        assert_eq!(json, json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn test_respond_without_model_is_collaborator_failure() {
        let err = services()
            .respond("ask", &[Message::user("hi")], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::Collaborator { .. }));
    }
}
