// SPDX-License-Identifier: MIT

//! Session state and its change log
//!
//! This module provides:
//! - `ExecutionContext` - variables, history and position of one session
//! - `Delta` / `DeltaOp` - the recorded changes that are the only way to mutate it
//! - `SessionStatus` - the lifecycle state machine

mod context;
mod delta;

pub use context::{Awaiting, ExecutionContext, GroupChoice};
pub use delta::{Delta, DeltaOp, Handoff};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::adk::model::Role;

/// Session variables; ordered so serialised contexts are deterministic
pub type Variables = BTreeMap<String, Value>;

/// One entry of the conversation history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Failed
                | SessionStatus::Cancelled
                | SessionStatus::Timeout
        )
    }

    /// `pending → running ⇄ waiting → {completed | failed | cancelled | timeout}`
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        if self.is_terminal() {
            return false;
        }
        if *self == next {
            return true;
        }
        match (self, next) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Running, _) => next != Pending,
            (Waiting, Running) | (Waiting, Cancelled) | (Waiting, Timeout) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

/// Errors applying deltas
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("Delta out of order: expected seq {expected}, found {found}")]
    OutOfOrder { expected: u64, found: u64 },

    #[error("Illegal status transition {from} -> {to}")]
    IllegalTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Timeout.is_terminal());
        assert!(!SessionStatus::Waiting.is_terminal());
        assert!(!SessionStatus::Pending.is_terminal());
    }

    #[test]
    fn test_legal_transitions() {
        use SessionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Waiting.can_transition_to(Cancelled));
        assert!(Waiting.can_transition_to(Timeout));
    }

    #[test]
    fn test_illegal_transitions() {
        use SessionStatus::*;
        assert!(!Pending.can_transition_to(Waiting));
        assert!(!Waiting.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Cancelled));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(SessionStatus::Timeout).unwrap(),
            serde_json::json!("timeout")
        );
        assert_eq!(SessionStatus::Waiting.to_string(), "waiting");
    }
}
