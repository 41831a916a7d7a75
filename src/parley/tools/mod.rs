// SPDX-License-Identifier: MIT

//! Tool registry: the default [`ToolExecutor`] handed to tool-call nodes

pub mod http;

pub use http::HttpTool;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::adk::error::ToolError;
use crate::adk::tool::{Tool, ToolContext, ToolExecutor, ToolResult};
use crate::parley::config::EngineConfig;
use crate::parley::error::ParleyError;

#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registry holding the webhook tools named in the config
    pub async fn from_config(config: &EngineConfig) -> Result<Self, ParleyError> {
        let registry = Self::new();
        for tool in &config.tools {
            registry.register(Arc::new(HttpTool::from_config(tool)?)).await;
        }
        Ok(registry)
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let mut tools = self.tools.write().await;
        log::debug!("Registering tool '{}'", tool.name());
        tools.insert(tool.name().to_string(), tool);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let tools = self.tools.read().await;
        tools.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let tools = self.tools.read().await;
        let mut names: Vec<String> = tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(&self, tool_name: &str, parameters: Value, context: &ToolContext) -> ToolResult {
        let Some(tool) = self.get(tool_name).await else {
            return ToolResult::err(ToolError::not_found(tool_name).to_string());
        };

        log::info!(
            "[{}] Calling tool '{}' from '{}'",
            context.session_id,
            tool_name,
            context.node_id
        );
        match tool.execute(parameters, context).await {
            Ok(output) => ToolResult::ok(output),
            Err(e) => {
                log::warn!("[{}] Tool '{}' failed: {}", context.session_id, tool_name, e);
                ToolResult::err(e.to_string())
            }
        }
    }
}
