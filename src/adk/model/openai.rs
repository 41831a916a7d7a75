// SPDX-License-Identifier: MIT

//! OpenAI Model - chat-completions implementation

use super::{LanguageModel, Message, ModelResponse, Role};
use crate::adk::error::ModelError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::env;

/// OpenAI-compatible chat model
pub struct OpenAiModel {
    client: Client,
    api_key: String,
    model_name: String,
    base_url: String,
}

impl OpenAiModel {
    /// Create a new OpenAiModel
    ///
    /// Requires `OPENAI_API_KEY` environment variable to be set.
    /// Optionally uses `OPENAI_BASE_URL` for custom endpoints.
    pub fn new(model_name: String) -> Result<Self, ModelError> {
        let api_key =
            env::var("OPENAI_API_KEY").map_err(|_| ModelError::ApiKeyMissing("openai".into()))?;
        let base_url =
            env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

        Ok(Self {
            client: Client::new(),
            api_key,
            model_name,
            base_url,
        })
    }

    /// Convert a message to OpenAI message format
    fn to_openai_message(message: &Message) -> Value {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Agent => "assistant",
        };
        json!({ "role": role, "content": message.content })
    }

    fn build_body(&self, messages: &[Message], output_schema: Option<&Value>) -> Value {
        let messages: Vec<Value> = messages.iter().map(Self::to_openai_message).collect();

        let mut body = json!({
            "model": self.model_name,
            "messages": messages
        });

        if let Some(schema) = output_schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "flow_output",
                    "schema": schema
                }
            });
        }

        body
    }

    /// Parse OpenAI response into a ModelResponse
    fn parse_openai_response(
        response: &Value,
        structured: bool,
    ) -> Result<ModelResponse, ModelError> {
        let choice = response["choices"]
            .as_array()
            .and_then(|c| c.first())
            .ok_or_else(|| ModelError::InvalidResponse("No choices in OpenAI response".into()))?;

        let content = choice["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        if structured {
            let data: Value = serde_json::from_str(&content).map_err(|e| {
                ModelError::InvalidResponse(format!("structured output is not JSON: {}", e))
            })?;
            return Ok(ModelResponse::structured(data));
        }

        Ok(ModelResponse::text(content))
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn respond(
        &self,
        messages: &[Message],
        output_schema: Option<&Value>,
    ) -> Result<ModelResponse, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(messages, output_schema);

        log::debug!(
            "OpenAI request body: {}",
            serde_json::to_string_pretty(&body).unwrap_or_default()
        );

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if resp.status() == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(ModelError::RateLimited { retry_after_secs });
        }

        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(ModelError::api("openai", text));
        }

        let resp_json: Value = resp.json().await?;
        log::debug!("OpenAI response: {}", resp_json);

        Self::parse_openai_response(&resp_json, output_schema.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> OpenAiModel {
        OpenAiModel {
            client: Client::new(),
            api_key: "test".to_string(),
            model_name: "gpt-4o-mini".to_string(),
            base_url: "http://localhost".to_string(),
        }
    }

    #[test]
    fn test_agent_role_maps_to_assistant() {
        let msg = OpenAiModel::to_openai_message(&Message::agent("I can help"));
        assert_eq!(msg["role"], "assistant");
        assert_eq!(msg["content"], "I can help");
    }

    #[test]
    fn test_body_without_schema_has_no_response_format() {
        let body = model().build_body(&[Message::user("Hello")], None);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn test_body_with_schema() {
        let schema = json!({"type": "object", "properties": {"action": {"type": "string"}}});
        let body = model().build_body(&[Message::system("route")], Some(&schema));
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["schema"], schema);
    }

    #[test]
    fn test_parse_text_response() {
        let response = json!({
            "choices": [{
                "message": { "role": "assistant", "content": "Hello, how can I help?" }
            }]
        });

        let parsed = OpenAiModel::parse_openai_response(&response, false).unwrap();
        assert_eq!(parsed.content.as_deref(), Some("Hello, how can I help?"));
        assert!(parsed.structured.is_none());
    }

    #[test]
    fn test_parse_structured_response() {
        let response = json!({
            "choices": [{
                "message": { "role": "assistant", "content": "{\"action\": \"book\", \"confidence\": 0.9}" }
            }]
        });

        let parsed = OpenAiModel::parse_openai_response(&response, true).unwrap();
        assert_eq!(parsed.structured.unwrap()["action"], "book");
        assert_eq!(parsed.confidence, Some(0.9));
    }

    #[test]
    fn test_parse_rejects_empty_choices() {
        let response = json!({ "choices": [] });
        assert!(OpenAiModel::parse_openai_response(&response, false).is_err());
    }
}
