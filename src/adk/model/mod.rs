// SPDX-License-Identifier: MIT

//! Model module - the language-model collaborator
//!
//! The engine only needs one call: hand over the conversation so far plus an
//! optional output schema and get back text and/or structured data.
//! Implementations:
//! - [openai] - any OpenAI-compatible chat-completions endpoint

pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ModelError;

/// Speaker of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Agent,
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self {
            role: Role::Agent,
            content: content.into(),
        }
    }
}

/// What the model answered
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Free text answer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Parsed JSON when an output schema was requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
    /// Self-reported confidence in `[0, 1]`, when the provider or schema gives one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn structured(data: Value) -> Self {
        let confidence = data.get("confidence").and_then(Value::as_f64);
        Self {
            content: None,
            structured: Some(data),
            confidence,
        }
    }
}

/// Core trait for language-model clients
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn respond(
        &self,
        messages: &[Message],
        output_schema: Option<&Value>,
    ) -> Result<ModelResponse, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_structured_response_lifts_confidence() {
        let resp = ModelResponse::structured(json!({"value": "B-XY 123", "confidence": 0.82}));
        assert_eq!(resp.confidence, Some(0.82));
        assert!(resp.content.is_none());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let msg = Message::agent("Hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "agent");
    }
}
