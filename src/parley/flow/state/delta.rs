// SPDX-License-Identifier: MIT

//! Deltas: the only way an execution context changes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{SessionStatus, Turn};
use crate::adk::model::Role;
use crate::parley::error::FailureCause;

/// Handoff marker left by a transfer node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handoff {
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One atomic change to an execution context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeltaOp {
    SetVariable {
        key: String,
        value: Value,
    },
    AppendTurn {
        turn: Turn,
    },
    SetStatus {
        status: SessionStatus,
    },
    /// Routing decision; a single target becomes the active node
    Route {
        targets: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    MarkExecuted {
        node_id: String,
    },
    SetAttempts {
        node_id: String,
        attempts: u32,
    },
    AwaitInput {
        node_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deadline: Option<DateTime<Utc>>,
    },
    ClearAwait,
    /// Staged mode: a node became schedulable through an edge from `from`
    Activate {
        node_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    /// An exclusive group was traversed from `source` to `target`
    Choose {
        group: String,
        source: String,
        target: String,
    },
    Handoff {
        handoff: Handoff,
    },
    Fail {
        cause: FailureCause,
    },
}

/// A recorded, replayable effect of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Position in the session log, assigned on commit
    pub seq: u64,
    /// Node that produced the delta, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub ops: Vec<DeltaOp>,
}

impl Delta {
    /// Start an empty delta for a node (or for the lifecycle manager with `None`)
    pub fn new(node_id: Option<&str>) -> Self {
        Self {
            seq: 0,
            node_id: node_id.map(str::to_string),
            recorded_at: Utc::now(),
            ops: Vec::new(),
        }
    }

    pub fn for_node(node_id: &str) -> Self {
        Self::new(Some(node_id))
    }

    pub fn push(&mut self, op: DeltaOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn set_var(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.push(DeltaOp::SetVariable {
            key: key.into(),
            value,
        })
    }

    pub fn append_turn(
        &mut self,
        role: Role,
        content: impl Into<String>,
        node_id: Option<&str>,
    ) -> &mut Self {
        self.push(DeltaOp::AppendTurn {
            turn: Turn {
                role,
                content: content.into(),
                node_id: node_id.map(str::to_string),
            },
        })
    }

    /// Agent speech attributed to the delta's node
    pub fn say(&mut self, content: impl Into<String>) -> &mut Self {
        let node = self.node_id.clone();
        self.append_turn(Role::Agent, content, node.as_deref())
    }

    pub fn set_status(&mut self, status: SessionStatus) -> &mut Self {
        self.push(DeltaOp::SetStatus { status })
    }

    pub fn route(&mut self, targets: Vec<String>, label: Option<String>) -> &mut Self {
        self.push(DeltaOp::Route { targets, label })
    }

    pub fn mark_executed(&mut self, node_id: impl Into<String>) -> &mut Self {
        self.push(DeltaOp::MarkExecuted {
            node_id: node_id.into(),
        })
    }

    pub fn set_attempts(&mut self, node_id: impl Into<String>, attempts: u32) -> &mut Self {
        self.push(DeltaOp::SetAttempts {
            node_id: node_id.into(),
            attempts,
        })
    }

    pub fn await_input(
        &mut self,
        node_id: impl Into<String>,
        deadline: Option<DateTime<Utc>>,
    ) -> &mut Self {
        self.push(DeltaOp::AwaitInput {
            node_id: node_id.into(),
            deadline,
        })
    }

    pub fn clear_await(&mut self) -> &mut Self {
        self.push(DeltaOp::ClearAwait)
    }

    pub fn activate(&mut self, node_id: impl Into<String>, from: Option<&str>) -> &mut Self {
        self.push(DeltaOp::Activate {
            node_id: node_id.into(),
            from: from.map(str::to_string),
        })
    }

    pub fn choose(
        &mut self,
        group: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> &mut Self {
        self.push(DeltaOp::Choose {
            group: group.into(),
            source: source.into(),
            target: target.into(),
        })
    }

    pub fn handoff(&mut self, handoff: Handoff) -> &mut Self {
        self.push(DeltaOp::Handoff { handoff })
    }

    pub fn fail(&mut self, cause: FailureCause) -> &mut Self {
        self.push(DeltaOp::Fail { cause })
    }

    /// Targets of the routing decision carried by this delta, if any
    pub fn route_targets(&self) -> Option<&[String]> {
        self.ops.iter().rev().find_map(|op| match op {
            DeltaOp::Route { targets, .. } => Some(targets.as_slice()),
            _ => None,
        })
    }

    /// True when the producing step already decided where to go next
    pub fn has_route(&self) -> bool {
        self.route_targets().is_some()
    }

    /// Last status transition carried by this delta
    pub fn status(&self) -> Option<SessionStatus> {
        self.ops.iter().rev().find_map(|op| match op {
            DeltaOp::SetStatus { status } => Some(*status),
            _ => None,
        })
    }

    /// Agent messages carried by this delta, in order
    pub fn agent_messages(&self) -> impl Iterator<Item = &str> {
        self.ops.iter().filter_map(|op| match op {
            DeltaOp::AppendTurn { turn } if turn.role == Role::Agent => Some(turn.content.as_str()),
            _ => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_collects_ops_in_order() {
        let mut delta = Delta::for_node("ask_name");
        delta
            .say("What is your name?")
            .await_input("ask_name", None)
            .set_status(SessionStatus::Waiting);

        assert_eq!(delta.ops.len(), 3);
        assert_eq!(delta.status(), Some(SessionStatus::Waiting));
        assert!(!delta.has_route());
        assert_eq!(
            delta.agent_messages().collect::<Vec<_>>(),
            vec!["What is your name?"]
        );
    }

    #[test]
    fn test_route_targets() {
        let mut delta = Delta::for_node("decide");
        delta.route(vec!["a".into()], None);
        assert_eq!(delta.route_targets(), Some(&["a".to_string()][..]));
        assert!(delta.has_route());
    }

    #[test]
    fn test_serialization_is_tagged() {
        let mut delta = Delta::for_node("n");
        delta.set_var("x", json!(5)).clear_await();
        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(json["ops"][0]["op"], "set_variable");
        assert_eq!(json["ops"][0]["key"], "x");
        assert_eq!(json["ops"][1]["op"], "clear_await");

        let back: Delta = serde_json::from_value(json).unwrap();
        assert_eq!(back, delta);
    }
}
