// SPDX-License-Identifier: MIT

//! Sessions and where they live between turns
//!
//! A session is persisted as three things: its [`SessionMeta`], the
//! append-only delta log, and an optional snapshot of the context at some
//! sequence number. Loading folds the log tail onto the snapshot, so a
//! session resumes the same way whichever process picks it up.

mod file;
mod memory;

pub use file::FileSessionStore;
pub use memory::MemorySessionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::{Delta, ExecutionContext, SessionStatus, StateError};
use super::strategy::Strategy;

/// Session store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session '{0}' already exists")]
    AlreadyExists(String),

    #[error("Session '{0}' not found in store")]
    NotFound(String),

    #[error("Invalid session id '{0}'")]
    InvalidId(String),

    /// The stored log does not fold into a valid context
    #[error("Session '{session_id}' log is corrupt: {source}")]
    Corrupt {
        session_id: String,
        #[source]
        source: StateError,
    },

    #[error("Session store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session store encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything about a session except its context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub flow_id: String,
    pub strategy: Strategy,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last time the caller sent input; drives the idle timeout
    pub last_input_at: DateTime<Utc>,
    /// Wait-node deadline while suspended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archived: bool,
}

impl SessionMeta {
    pub fn new(session_id: impl Into<String>, flow_id: impl Into<String>, strategy: Strategy) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            flow_id: flow_id.into(),
            strategy,
            status: SessionStatus::Pending,
            created_at: now,
            updated_at: now,
            last_input_at: now,
            deadline: None,
            archived: false,
        }
    }

    /// Refresh status, deadline and timestamps from the context
    pub fn sync(&mut self, context: &ExecutionContext) {
        self.status = context.status();
        self.deadline = context.awaiting().and_then(|a| a.deadline);
        self.updated_at = Utc::now();
    }
}

/// A session as loaded from a store
#[derive(Debug, Clone)]
pub struct Session {
    pub meta: SessionMeta,
    pub context: ExecutionContext,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.meta.session_id
    }

    pub fn status(&self) -> SessionStatus {
        self.context.status()
    }
}

/// Persistence contract for sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Register a new session; fails if the id is taken
    async fn create(&self, meta: &SessionMeta) -> Result<(), StoreError>;

    /// Rebuild a session from its snapshot and log tail
    async fn load(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    /// Append one committed delta to the log
    async fn append(&self, session_id: &str, delta: &Delta) -> Result<(), StoreError>;

    /// Full ordered delta log
    async fn log(&self, session_id: &str) -> Result<Vec<Delta>, StoreError>;

    /// Record a full-context snapshot at `context.last_seq()`
    async fn snapshot(&self, session_id: &str, context: &ExecutionContext) -> Result<(), StoreError>;

    async fn save_meta(&self, meta: &SessionMeta) -> Result<(), StoreError>;

    /// Mark a terminal session archived; its log stays readable
    async fn archive(&self, session_id: &str) -> Result<(), StoreError>;

    /// Unarchived sessions currently in `waiting`
    async fn list_waiting(&self) -> Result<Vec<SessionMeta>, StoreError>;
}

/// Fold the deltas after the snapshot onto it
pub(crate) fn rebuild(
    session_id: &str,
    snapshot: Option<ExecutionContext>,
    log: &[Delta],
) -> Result<ExecutionContext, StoreError> {
    let mut context = snapshot.unwrap_or_default();
    let from = context.last_seq();
    context
        .replay_onto(log.iter().filter(|d| d.seq > from))
        .map_err(|source| StoreError::Corrupt {
            session_id: session_id.to_string(),
            source,
        })?;
    Ok(context)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Store contract checks shared by both backends

    use super::*;
    use crate::parley::flow::state::Delta;
    use serde_json::json;

    pub fn delta(seq: u64, build: impl FnOnce(&mut Delta)) -> Delta {
        let mut delta = Delta::new(None);
        delta.seq = seq;
        build(&mut delta);
        delta
    }

    /// Create, append, snapshot, append again, then reload
    pub async fn roundtrip(store: &dyn SessionStore) {
        let meta = SessionMeta::new("s1", "flow", Strategy::Sequential);
        store.create(&meta).await.unwrap();
        assert!(matches!(
            store.create(&meta).await,
            Err(StoreError::AlreadyExists(_))
        ));

        let d1 = delta(1, |d| {
            d.set_status(SessionStatus::Running).set_var("a", json!(1));
        });
        let d2 = delta(2, |d| {
            d.set_var("b", json!("two"));
        });
        let d3 = delta(3, |d| {
            d.await_input("ask", None).set_status(SessionStatus::Waiting);
        });

        let mut live = ExecutionContext::new();
        for d in [&d1, &d2] {
            live.apply(d).unwrap();
            store.append("s1", d).await.unwrap();
        }
        store.snapshot("s1", &live).await.unwrap();
        live.apply(&d3).unwrap();
        store.append("s1", &d3).await.unwrap();

        let mut meta = meta;
        meta.sync(&live);
        store.save_meta(&meta).await.unwrap();

        let session = store.load("s1").await.unwrap().unwrap();
        assert_eq!(session.context, live);
        assert_eq!(session.meta.status, SessionStatus::Waiting);
        assert_eq!(store.log("s1").await.unwrap().len(), 3);

        let waiting = store.list_waiting().await.unwrap();
        assert_eq!(waiting.len(), 1);

        store.archive("s1").await.unwrap();
        assert!(store.list_waiting().await.unwrap().is_empty());
        let archived = store.load("s1").await.unwrap().unwrap();
        assert!(archived.meta.archived);
        assert_eq!(archived.context, live);

        assert!(store.load("nope").await.unwrap().is_none());
        assert!(matches!(
            store.append("nope", &d1).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
