// SPDX-License-Identifier: MIT

//! Typed errors raised by external collaborators
//!
//! Every collaborator failure the engine can observe (tool, model, memory)
//! funnels into [`CollaboratorError`] so node executors can decide between
//! an error edge and failing the session without inspecting provider details.

use thiserror::Error;

/// Failure of any external collaborator
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// Tool execution failed
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// Language model call failed
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Memory service failed
    #[error("Memory error: {0}")]
    Memory(String),

    /// The collaborator did not answer within its bound
    #[error("{collaborator} timed out after {secs}s")]
    Timeout { collaborator: String, secs: u64 },
}

/// Tool-specific errors
#[derive(Debug, Error)]
pub enum ToolError {
    /// Tool not registered
    #[error("Tool '{name}' not found")]
    NotFound { name: String },

    /// The tool ran and reported a failure
    #[error("Tool '{name}' failed: {message}")]
    Failed { name: String, message: String },

    /// Transport errors talking to a remote tool
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Malformed tool payloads
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Model/LLM-specific errors
#[derive(Debug, Error)]
pub enum ModelError {
    /// API key not configured
    #[error("API key not configured for provider: {0}")]
    ApiKeyMissing(String),

    /// Provider returned a non-success status
    #[error("API error from {provider}: {message}")]
    Api { provider: String, message: String },

    /// Rate limit exceeded
    #[error("Rate limit exceeded, retry after {retry_after_secs:?} seconds")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Invalid response from model
    #[error("Invalid response from model: {0}")]
    InvalidResponse(String),

    /// Transport errors
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl ToolError {
    /// Create a tool not found error
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Create a tool failure
    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl ModelError {
    /// Create an API error
    pub fn api(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

impl CollaboratorError {
    pub fn timeout(collaborator: impl Into<String>, secs: u64) -> Self {
        Self::Timeout {
            collaborator: collaborator.into(),
            secs,
        }
    }
}
