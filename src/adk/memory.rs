// SPDX-License-Identifier: MIT

//! Memory/identity service
//!
//! Elicit nodes may consult memory to skip asking for values the caller
//! already gave in an earlier conversation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::error::CollaboratorError;

/// Opaque handle to one identity's memory
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryHandle(pub String);

#[async_trait]
pub trait MemoryService: Send + Sync {
    async fn get_or_create(&self, identity: &str) -> Result<MemoryHandle, CollaboratorError>;

    async fn store(
        &self,
        handle: &MemoryHandle,
        key: &str,
        value: Value,
    ) -> Result<(), CollaboratorError>;

    async fn retrieve(
        &self,
        handle: &MemoryHandle,
        key: &str,
    ) -> Result<Option<Value>, CollaboratorError>;
}

/// Process-local memory, keyed by identity
#[derive(Clone, Default)]
pub struct InMemoryMemory {
    entries: Arc<RwLock<HashMap<String, HashMap<String, Value>>>>,
}

impl InMemoryMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryService for InMemoryMemory {
    async fn get_or_create(&self, identity: &str) -> Result<MemoryHandle, CollaboratorError> {
        let mut entries = self.entries.write().await;
        entries.entry(identity.to_string()).or_default();
        Ok(MemoryHandle(identity.to_string()))
    }

    async fn store(
        &self,
        handle: &MemoryHandle,
        key: &str,
        value: Value,
    ) -> Result<(), CollaboratorError> {
        let mut entries = self.entries.write().await;
        entries
            .entry(handle.0.clone())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn retrieve(
        &self,
        handle: &MemoryHandle,
        key: &str,
    ) -> Result<Option<Value>, CollaboratorError> {
        let entries = self.entries.read().await;
        Ok(entries.get(&handle.0).and_then(|m| m.get(key)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let memory = InMemoryMemory::new();
        let handle = memory.get_or_create("+4915112345").await.unwrap();

        memory.store(&handle, "name", json!("Ada")).await.unwrap();
        assert_eq!(
            memory.retrieve(&handle, "name").await.unwrap(),
            Some(json!("Ada"))
        );
        assert_eq!(memory.retrieve(&handle, "plate").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_identities_are_isolated() {
        let memory = InMemoryMemory::new();
        let a = memory.get_or_create("a").await.unwrap();
        let b = memory.get_or_create("b").await.unwrap();

        memory.store(&a, "name", json!("Ada")).await.unwrap();
        assert_eq!(memory.retrieve(&b, "name").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clone_shares_state() {
        let memory = InMemoryMemory::new();
        let cloned = memory.clone();
        let handle = cloned.get_or_create("x").await.unwrap();
        cloned.store(&handle, "k", json!(1)).await.unwrap();

        assert_eq!(memory.retrieve(&handle, "k").await.unwrap(), Some(json!(1)));
    }
}
