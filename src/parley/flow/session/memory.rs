// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{rebuild, Session, SessionMeta, SessionStore, StoreError};
use crate::parley::flow::state::{Delta, ExecutionContext, SessionStatus};

struct Record {
    meta: SessionMeta,
    log: Vec<Delta>,
    snapshot: Option<ExecutionContext>,
}

/// Process-local session store, for tests and single-process use
#[derive(Default)]
pub struct MemorySessionStore {
    records: RwLock<HashMap<String, Record>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, meta: &SessionMeta) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&meta.session_id) {
            return Err(StoreError::AlreadyExists(meta.session_id.clone()));
        }
        records.insert(
            meta.session_id.clone(),
            Record {
                meta: meta.clone(),
                log: Vec::new(),
                snapshot: None,
            },
        );
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let records = self.records.read().await;
        let Some(record) = records.get(session_id) else {
            return Ok(None);
        };
        let context = rebuild(session_id, record.snapshot.clone(), &record.log)?;
        Ok(Some(Session {
            meta: record.meta.clone(),
            context,
        }))
    }

    async fn append(&self, session_id: &str, delta: &Delta) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        record.log.push(delta.clone());
        Ok(())
    }

    async fn log(&self, session_id: &str) -> Result<Vec<Delta>, StoreError> {
        let records = self.records.read().await;
        records
            .get(session_id)
            .map(|r| r.log.clone())
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }

    async fn snapshot(&self, session_id: &str, context: &ExecutionContext) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        record.snapshot = Some(context.clone());
        Ok(())
    }

    async fn save_meta(&self, meta: &SessionMeta) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&meta.session_id)
            .ok_or_else(|| StoreError::NotFound(meta.session_id.clone()))?;
        record.meta = meta.clone();
        Ok(())
    }

    async fn archive(&self, session_id: &str) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        record.meta.archived = true;
        Ok(())
    }

    async fn list_waiting(&self) -> Result<Vec<SessionMeta>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| !r.meta.archived && r.meta.status == SessionStatus::Waiting)
            .map(|r| r.meta.clone())
            .collect())
    }
}
