// SPDX-License-Identifier: MIT

//! Engine error taxonomy
//!
//! [`ParleyError`] is what engine calls return. When an error terminates a
//! session it is also recorded in the session as a serialisable
//! [`FailureCause`], so the caller and an operator can both see why.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adk::error::CollaboratorError;
use crate::parley::flow::condition::ExpressionError;
use crate::parley::flow::graph::{GraphError, NodeType};
use crate::parley::flow::session::StoreError;
use crate::parley::flow::state::{SessionStatus, StateError};

/// Top-level error type for parley-rs
#[derive(Debug, Error)]
pub enum ParleyError {
    /// Flow rejected at load time
    #[error("Graph integrity failure: {0}")]
    Graph(#[from] GraphError),

    /// Routing could not be resolved; always fatal to the session
    #[error("Routing failure at node '{node_id}': {message}")]
    Routing { node_id: String, message: String },

    /// Input validation exhausted with no fallback edge
    #[error("Validation failure at node '{node_id}': {message}")]
    Validation { node_id: String, message: String },

    /// Tool/model/memory failure that the node did not absorb
    #[error("Collaborator failure at node '{node_id}': {source}")]
    Collaborator {
        node_id: String,
        #[source]
        source: CollaboratorError,
    },

    /// Unparseable or throwing expression
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    /// Delta could not be applied
    #[error(transparent)]
    State(#[from] StateError),

    /// Session store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Flow '{0}' not found")]
    FlowNotFound(String),

    #[error("Session '{0}' not found")]
    SessionNotFound(String),

    #[error("Session '{session_id}' belongs to flow '{actual}', not '{requested}'")]
    FlowMismatch {
        session_id: String,
        requested: String,
        actual: String,
    },

    /// Only waiting (or interrupted) sessions accept input
    #[error("Session '{session_id}' is {status} and cannot be advanced")]
    SessionNotWaiting {
        session_id: String,
        status: SessionStatus,
    },

    #[error("Node '{0}' not found")]
    NodeNotFound(String),

    #[error("No executor registered for node type '{0}'")]
    NoExecutor(NodeType),

    /// Configuration errors (bad config file, invalid env override)
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// Failure classes recorded on a failed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Routing,
    Collaborator,
    Expression,
    Internal,
}

/// Structured reason a session failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub kind: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub message: String,
}

impl ParleyError {
    /// Create a routing failure
    pub fn routing(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Routing {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    /// Create a validation failure
    pub fn validation(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    /// Create a collaborator failure
    pub fn collaborator(node_id: impl Into<String>, source: impl Into<CollaboratorError>) -> Self {
        Self::Collaborator {
            node_id: node_id.into(),
            source: source.into(),
        }
    }

    /// Classify this error for the session record
    pub fn to_cause(&self, node_id: Option<&str>) -> FailureCause {
        let (kind, node) = match self {
            ParleyError::Routing { node_id, .. } => (FailureKind::Routing, Some(node_id.as_str())),
            ParleyError::Validation { node_id, .. } => {
                (FailureKind::Validation, Some(node_id.as_str()))
            }
            ParleyError::Collaborator { node_id, .. } => {
                (FailureKind::Collaborator, Some(node_id.as_str()))
            }
            ParleyError::Expression(_) => (FailureKind::Expression, node_id),
            _ => (FailureKind::Internal, node_id),
        };

        FailureCause {
            kind,
            node_id: node.map(str::to_string),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adk::error::ToolError;

    #[test]
    fn test_routing_cause() {
        let err = ParleyError::routing("ask", "no edge labelled 'maybe'");
        let cause = err.to_cause(None);
        assert_eq!(cause.kind, FailureKind::Routing);
        assert_eq!(cause.node_id.as_deref(), Some("ask"));
        assert!(cause.message.contains("maybe"));
    }

    #[test]
    fn test_expression_cause_takes_node_from_caller() {
        let err: ParleyError = ExpressionError::eval("cannot read property 'a' of null").into();
        let cause = err.to_cause(Some("check"));
        assert_eq!(cause.kind, FailureKind::Expression);
        assert_eq!(cause.node_id.as_deref(), Some("check"));
    }

    #[test]
    fn test_collaborator_cause() {
        let err = ParleyError::collaborator("lookup", ToolError::not_found("crm"));
        let cause = err.to_cause(None);
        assert_eq!(cause.kind, FailureKind::Collaborator);
        assert!(cause.message.contains("crm"));
    }

    #[test]
    fn test_failure_cause_serialization() {
        let cause = FailureCause {
            kind: FailureKind::Validation,
            node_id: None,
            message: "bad".into(),
        };
        let json = serde_json::to_value(&cause).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "validation", "message": "bad"}));
    }
}
