// SPDX-License-Identifier: MIT

//! Webhook tools
//!
//! An [`HttpTool`] posts `{"tool", "parameters", "session_id"}` to its URL
//! and returns the JSON body. A body of the form
//! `{"results": [{"result": ...}]}` is unwrapped, and `{"success": false}`
//! is treated as a failure even on a 2xx status.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde_json::{json, Value};
use url::Url;

use crate::adk::error::ToolError;
use crate::adk::tool::{Tool, ToolContext};
use crate::parley::config::HttpToolConfig;
use crate::parley::error::ParleyError;

/// Shared so webhook tools reuse connections
static CLIENT: Lazy<Client> = Lazy::new(Client::new);

pub struct HttpTool {
    name: String,
    description: String,
    url: Url,
    headers: HeaderMap,
    client: Client,
}

impl HttpTool {
    pub fn new(name: impl Into<String>, url: &str) -> Result<Self, ParleyError> {
        let name = name.into();
        let url = parse_url(&name, url)?;
        Ok(Self {
            description: format!("Webhook at {}", url),
            name,
            url,
            headers: HeaderMap::new(),
            client: CLIENT.clone(),
        })
    }

    pub fn from_config(config: &HttpToolConfig) -> Result<Self, ParleyError> {
        let mut tool = Self::new(&config.name, &config.url)?;
        if !config.description.is_empty() {
            tool.description = config.description.clone();
        }
        for (key, value) in &config.headers {
            let header = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                ParleyError::Config(format!("tool '{}': bad header '{}': {}", config.name, key, e))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                ParleyError::Config(format!("tool '{}': bad value for '{}': {}", config.name, key, e))
            })?;
            tool.headers.insert(header, value);
        }
        Ok(tool)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

fn parse_url(name: &str, raw: &str) -> Result<Url, ParleyError> {
    let url = Url::parse(raw)
        .map_err(|e| ParleyError::Config(format!("tool '{}': invalid url '{}': {}", name, raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ParleyError::Config(format!(
            "tool '{}': unsupported scheme '{}'",
            name, other
        ))),
    }
}

/// Turn a webhook response body into the tool output
fn interpret(name: &str, body: Value) -> Result<Value, ToolError> {
    let body = match body {
        Value::Object(mut map) if map.contains_key("results") => {
            match map.remove("results") {
                Some(Value::Array(mut results)) if !results.is_empty() => {
                    let mut first = results.swap_remove(0);
                    first.get_mut("result").map(Value::take).unwrap_or(first)
                }
                _ => Value::Object(map),
            }
        }
        other => other,
    };

    if body.get("success") == Some(&Value::Bool(false)) {
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("webhook reported failure");
        return Err(ToolError::failed(name, message));
    }
    Ok(body)
}

#[async_trait]
impl Tool for HttpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self, parameters: Value, context: &ToolContext) -> Result<Value, ToolError> {
        let payload = json!({
            "tool": self.name,
            "parameters": parameters,
            "session_id": context.session_id,
        });
        log::debug!("POST {} for tool '{}'", self.url, self.name);

        let resp = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header("Accept", "application/json")
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ToolError::failed(
                &self.name,
                format!("webhook returned {}: {}", status, text),
            ));
        }

        let body: Value = resp.json().await?;
        interpret(&self.name, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use std::collections::BTreeMap;

    #[test]
    fn test_rejects_bad_urls() {
        assert!(HttpTool::new("t", "not a url").is_err());
        let err = HttpTool::new("t", "ftp://example.com/x").err().unwrap();
        assert!(err.to_string().contains("scheme"));
        assert!(HttpTool::new("t", "https://example.com/hook").is_ok());
    }

    #[test]
    fn test_config_headers() {
        let mut headers = BTreeMap::new();
        headers.insert("X-Api-Key".to_string(), "secret".to_string());
        let tool = HttpTool::from_config(&HttpToolConfig {
            name: "crm".into(),
            description: "CRM lookup".into(),
            url: "https://example.com/crm".into(),
            headers,
        })
        .unwrap();
        assert_eq!(tool.description(), "CRM lookup");
        assert_eq!(tool.headers.get("x-api-key").unwrap(), "secret");
    }

    #[test]
    fn test_interpret_unwraps_results() {
        let body = json!({"results": [{"toolCallId": "1", "result": {"slots": ["10:00"]}}]});
        assert_eq!(interpret("t", body).unwrap(), json!({"slots": ["10:00"]}));
    }

    #[test]
    fn test_interpret_reported_failure() {
        let body = json!({"success": false, "error": "no availability"});
        let err = interpret("t", body).unwrap_err();
        assert!(err.to_string().contains("no availability"));
    }

    #[test]
    fn test_interpret_plain_body() {
        let body = json!({"success": true, "date": "2024-05-01"});
        assert_eq!(interpret("t", body.clone()).unwrap(), body);
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/hook", addr)
    }

    #[tokio::test]
    async fn test_posts_parameters_and_session() {
        let app = Router::new().route(
            "/hook",
            post(|Json(body): Json<Value>| async move { Json(json!({ "echo": body })) }),
        );
        let tool = HttpTool::new("lookup", &serve(app).await).unwrap();
        let context = ToolContext {
            session_id: "s-1".into(),
            ..Default::default()
        };

        let output = tool.execute(json!({"plate": "AB 12"}), &context).await.unwrap();
        assert_eq!(output["echo"]["tool"], "lookup");
        assert_eq!(output["echo"]["parameters"]["plate"], "AB 12");
        assert_eq!(output["echo"]["session_id"], "s-1");
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let app = Router::new().route(
            "/hook",
            post(|| async { (axum::http::StatusCode::BAD_GATEWAY, "upstream down") }),
        );
        let tool = HttpTool::new("lookup", &serve(app).await).unwrap();
        let err = tool
            .execute(json!({}), &ToolContext::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("502"));
    }
}
