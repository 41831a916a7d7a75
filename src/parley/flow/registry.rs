// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::sync::Arc;

use super::graph::{NodeDefinition, NodeType};
use super::nodes::{
    DecisionExecutor, ElicitExecutor, EndExecutor, EntryExecutor, FanInExecutor, FanOutExecutor,
    LlmExecutor, NodeContext, NodeExecutor, NodeOutcome, ToolCallExecutor, TransferExecutor,
    WaitExecutor,
};
use crate::parley::error::ParleyError;

/// Node type → executor lookup
///
/// Built once at engine start and shared read-only by every session.
#[derive(Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<NodeType, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    /// An empty registry; every node type must be registered by hand
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Registry with the built-in executor for every node type
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EntryExecutor));
        registry.register(Arc::new(ElicitExecutor));
        registry.register(Arc::new(DecisionExecutor));
        registry.register(Arc::new(ToolCallExecutor));
        registry.register(Arc::new(LlmExecutor));
        registry.register(Arc::new(TransferExecutor));
        registry.register(Arc::new(EndExecutor));
        registry.register(Arc::new(WaitExecutor));
        registry.register(Arc::new(FanOutExecutor));
        registry.register(Arc::new(FanInExecutor));
        registry
    }

    /// Register an executor, replacing any previous one for its node type
    pub fn register(&mut self, executor: Arc<dyn NodeExecutor>) {
        let node_type = executor.node_type();
        if self.executors.insert(node_type, executor).is_some() {
            log::debug!("Replaced executor for node type '{}'", node_type);
        }
    }

    pub fn get(&self, node_type: NodeType) -> Option<&Arc<dyn NodeExecutor>> {
        self.executors.get(&node_type)
    }

    /// Dispatch `node` to its executor
    pub async fn execute(
        &self,
        node: &NodeDefinition,
        cx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, ParleyError> {
        let executor = self
            .get(node.node_type())
            .ok_or(ParleyError::NoExecutor(node.node_type()))?;
        log::debug!(
            "[{}] Executing {} node '{}'",
            cx.session_id,
            node.node_type(),
            node.id
        );
        executor.execute(node, cx).await
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
