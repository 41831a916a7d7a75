// SPDX-License-Identifier: MIT

//! Flow definition types
//!
//! These are the serialisable shapes of a flow file. Node kinds form a closed
//! tagged union keyed by `type`; each kind carries its own config.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::parley::flow::state::Variables;
use crate::parley::flow::strategy::Strategy;

/// A complete flow: metadata, nodes and edges
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlowDefinition {
    /// Unique flow identifier, used by `advance(flow_id, ..)`
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: FlowMetadata,
    /// Nodes in declaration order
    pub nodes: Vec<NodeDefinition>,
    /// Edges in declaration order (order breaks priority ties)
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

/// Per-flow execution hints
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FlowMetadata {
    /// Explicit strategy; always honoured when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    /// Session idle timeout, overrides the engine config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
    /// Staged fan-out limit, overrides the engine config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fan_out: Option<usize>,
}

/// A node in the flow graph
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeDefinition {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl NodeDefinition {
    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }
}

/// Type tag plus type-specific config
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Entry(EntryConfig),
    #[serde(alias = "message")]
    Elicit(ElicitConfig),
    Decision(DecisionConfig),
    ToolCall(ToolCallConfig),
    Llm(LlmConfig),
    Transfer(TransferConfig),
    End(EndConfig),
    Wait(WaitConfig),
    FanOut(FanOutConfig),
    FanIn(FanInConfig),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Entry(_) => NodeType::Entry,
            NodeKind::Elicit(_) => NodeType::Elicit,
            NodeKind::Decision(_) => NodeType::Decision,
            NodeKind::ToolCall(_) => NodeType::ToolCall,
            NodeKind::Llm(_) => NodeType::Llm,
            NodeKind::Transfer(_) => NodeType::Transfer,
            NodeKind::End(_) => NodeType::End,
            NodeKind::Wait(_) => NodeType::Wait,
            NodeKind::FanOut(_) => NodeType::FanOut,
            NodeKind::FanIn(_) => NodeType::FanIn,
        }
    }
}

/// Registry key for node executors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Entry,
    Elicit,
    Decision,
    ToolCall,
    Llm,
    Transfer,
    End,
    Wait,
    FanOut,
    FanIn,
}

impl NodeType {
    /// Terminal nodes end the session
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeType::End | NodeType::Transfer)
    }

    /// Only meaningful under the staged strategy
    pub fn is_staged_only(&self) -> bool {
        matches!(self, NodeType::FanOut | NodeType::FanIn)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Entry => "entry",
            NodeType::Elicit => "elicit",
            NodeType::Decision => "decision",
            NodeType::ToolCall => "tool_call",
            NodeType::Llm => "llm",
            NodeType::Transfer => "transfer",
            NodeType::End => "end",
            NodeType::Wait => "wait",
            NodeType::FanOut => "fan_out",
            NodeType::FanIn => "fan_in",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EntryConfig {
    /// Variables set before the start payload is merged in
    #[serde(default)]
    pub defaults: Variables,
}

/// Ask the user for something and validate the answer
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ElicitConfig {
    /// Prompt template, `{{expr}}` placeholders allowed
    pub prompt: String,
    /// Variable that receives the accepted value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    #[serde(default)]
    pub validator: Validator,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Sent instead of the prompt after a rejected answer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_prompt: Option<String>,
    /// Edge label followed when retries are exhausted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_exhausted: Option<String>,
    /// Look the value up in long-term memory before asking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryLookup>,
}

fn default_max_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryLookup {
    /// Identity template, e.g. `{{caller_id}}`
    pub identity: String,
    pub key: String,
}

/// How an elicited answer is checked
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Validator {
    /// Any non-empty answer
    #[default]
    Any,
    /// One of a fixed set of answers
    Exact {
        values: Vec<String>,
        #[serde(default)]
        case_sensitive: bool,
    },
    /// Answer must match a regular expression
    Pattern { regex: String },
    /// Structured extraction through the language model
    Extract {
        schema: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instructions: Option<String>,
        /// Overrides `extraction.min_confidence`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_confidence: Option<f64>,
    },
    /// Map the answer onto one of a closed label set; the label routes
    Classify {
        labels: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instructions: Option<String>,
    },
}

impl Validator {
    pub fn kind(&self) -> &'static str {
        match self {
            Validator::Any => "any",
            Validator::Exact { .. } => "exact",
            Validator::Pattern { .. } => "pattern",
            Validator::Extract { .. } => "extract",
            Validator::Classify { .. } => "classify",
        }
    }
}

/// Decisions carry no config; their edges hold the conditions
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DecisionConfig {}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolCallConfig {
    pub tool: String,
    /// String leaves are interpolated before the call
    #[serde(default)]
    pub parameters: Value,
    /// Variable that receives the output (defaults to `<node_id>_result`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
    #[serde(default)]
    pub continue_on_error: bool,
    /// Overrides `tool_timeout_secs`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// System instructions template
    pub instructions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Variable that receives the content or structured result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
    /// Send the conversation history along with the instructions
    #[serde(default = "default_true")]
    pub include_history: bool,
    /// Speak the model's text content to the user
    #[serde(default)]
    pub speak: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransferConfig {
    /// Destination template (queue, number, agent id)
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EndConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Suspend until an external event or a deadline
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WaitConfig {
    /// Only this event resumes the node; any event when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Variable that receives the event payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FanOutConfig {}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FanInConfig {
    #[serde(default)]
    pub wait_for: WaitMode,
    /// Arrivals needed for `wait_for: count`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    /// Branches needed for `wait_for: nodes`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
}

/// How a join waits for its incoming branches
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WaitMode {
    /// Every incoming branch (default)
    #[default]
    All,
    /// Any single branch
    Any,
    /// At least `count` branches
    Count,
    /// The named subset of branches
    Nodes,
}

/// A transition between two nodes
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EdgeDefinition {
    #[serde(alias = "from")]
    pub source: String,
    #[serde(alias = "to")]
    pub target: String,
    #[serde(default)]
    pub kind: EdgeKind,
    /// Symbolic name for label routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Condition for conditional and exclusive edges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Exclusive group; defaults to one group per source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Higher is evaluated first
    #[serde(default)]
    pub priority: i32,
}

impl EdgeDefinition {
    /// Unlabeled default edge, the only kind auto-advance may take
    pub fn is_plain_default(&self) -> bool {
        self.kind == EdgeKind::Default && self.label.is_none() && self.condition.is_none()
    }

    /// Conditional and exclusive edges are chosen by evaluating a condition
    pub fn is_guarded(&self) -> bool {
        matches!(self.kind, EdgeKind::Conditional | EdgeKind::Exclusive)
    }

    /// Exclusive group name, one implicit group per source
    pub fn exclusive_group(&self) -> Option<String> {
        match self.kind {
            EdgeKind::Exclusive => Some(
                self.group
                    .clone()
                    .unwrap_or_else(|| format!("{}:exclusive", self.source)),
            ),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    #[default]
    Default,
    Conditional,
    Exclusive,
    Parallel,
    Error,
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_kind_from_yaml() {
        let yaml = r#"
            id: ask_plate
            type: elicit
            prompt: "What is your plate number?"
            variable: plate
            validator:
              kind: pattern
              regex: "^[A-Z0-9-]{4,10}$"
            max_retries: 3
        "#;
        let node: NodeDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(node.node_type(), NodeType::Elicit);
        match node.kind {
            NodeKind::Elicit(cfg) => {
                assert_eq!(cfg.variable.as_deref(), Some("plate"));
                assert_eq!(cfg.max_retries, 3);
                assert_eq!(cfg.validator.kind(), "pattern");
            }
            other => panic!("unexpected kind {:?}", other.node_type()),
        }
    }

    #[test]
    fn test_message_alias_and_defaults() {
        let yaml = r#"
            id: greet
            type: message
            prompt: "Hello"
        "#;
        let node: NodeDefinition = serde_yaml::from_str(yaml).unwrap();
        match node.kind {
            NodeKind::Elicit(cfg) => {
                assert_eq!(cfg.max_retries, 2);
                assert_eq!(cfg.validator.kind(), "any");
            }
            other => panic!("unexpected kind {:?}", other.node_type()),
        }
    }

    #[test]
    fn test_config_free_nodes() {
        let node: NodeDefinition = serde_yaml::from_str("id: done\ntype: end").unwrap();
        assert_eq!(node.node_type(), NodeType::End);
        assert!(node.node_type().is_terminal());

        let node: NodeDefinition = serde_yaml::from_str("id: route\ntype: decision").unwrap();
        assert_eq!(node.node_type(), NodeType::Decision);
    }

    #[test]
    fn test_fan_in_wait_mode() {
        let yaml = r#"
            id: join
            type: fan_in
            wait_for: count
            count: 2
        "#;
        let node: NodeDefinition = serde_yaml::from_str(yaml).unwrap();
        match node.kind {
            NodeKind::FanIn(cfg) => {
                assert_eq!(cfg.wait_for, WaitMode::Count);
                assert_eq!(cfg.count, Some(2));
            }
            other => panic!("unexpected kind {:?}", other.node_type()),
        }
        assert_eq!(WaitMode::default(), WaitMode::All);
    }

    #[test]
    fn test_edge_defaults_and_aliases() {
        let yaml = r#"
            from: a
            to: b
        "#;
        let edge: EdgeDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(edge.source, "a");
        assert_eq!(edge.kind, EdgeKind::Default);
        assert!(edge.is_plain_default());
        assert_eq!(edge.exclusive_group(), None);
    }

    #[test]
    fn test_exclusive_group_defaults_per_source() {
        let yaml = r#"
            source: confirm
            target: yes_branch
            kind: exclusive
            condition: "answer == 'yes'"
        "#;
        let edge: EdgeDefinition = serde_yaml::from_str(yaml).unwrap();
        assert!(edge.is_guarded());
        assert_eq!(edge.exclusive_group().as_deref(), Some("confirm:exclusive"));
    }

    #[test]
    fn test_node_type_display() {
        assert_eq!(NodeType::ToolCall.to_string(), "tool_call");
        assert_eq!(NodeType::FanIn.to_string(), "fan_in");
        assert!(NodeType::FanOut.is_staged_only());
    }
}
