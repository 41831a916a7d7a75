// SPDX-License-Identifier: MIT

//! Tool contracts
//!
//! [`Tool`] is one callable capability; [`ToolExecutor`] is the narrow seam a
//! tool-call node talks to. The executor reports failures in-band through
//! [`ToolResult`] so that a node can follow its error edge.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ToolError;

/// Session facts handed to a tool alongside its parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolContext {
    pub session_id: String,
    pub flow_id: String,
    pub node_id: String,
    /// Snapshot of the session variables at call time
    #[serde(default)]
    pub variables: Value,
}

/// Outcome of one tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(message.into()),
        }
    }
}

/// Trait for tools that can be invoked from a flow.
///
/// `name()` and `description()` return `&str`; implementations store them in
/// struct fields.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the tool name (unique within a registry)
    fn name(&self) -> &str;

    /// Returns a human-readable description of what the tool does
    fn description(&self) -> &str;

    /// Execute the tool with resolved parameters
    async fn execute(&self, parameters: Value, context: &ToolContext) -> Result<Value, ToolError>;
}

/// The tool-execution collaborator consumed by tool-call nodes
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, tool_name: &str, parameters: Value, context: &ToolContext)
        -> ToolResult;
}
