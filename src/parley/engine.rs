// SPDX-License-Identifier: MIT

//! Session lifecycle: create, resume, cancel and expire sessions
//!
//! [`FlowEngine::advance`] is the single entry point callers drive a
//! conversation through. Each call holds a per-session lock for its whole
//! duration, so deltas of one session are applied strictly in order while
//! different sessions advance in parallel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::parley::error::{FailureCause, ParleyError};
use crate::parley::flow::graph::FlowGraph;
use crate::parley::flow::loader::FlowCatalog;
use crate::parley::flow::nodes::{ExternalInput, Services, TIMEOUT_EVENT};
use crate::parley::flow::registry::ExecutorRegistry;
use crate::parley::flow::runner::{self, Recorder, RunEnv};
use crate::parley::flow::session::{Session, SessionMeta, SessionStore};
use crate::parley::flow::state::{Delta, ExecutionContext, Handoff, SessionStatus, StateError};
use crate::parley::flow::strategy;

/// What a caller gets back from every lifecycle call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvanceResponse {
    pub session_id: String,
    pub status: SessionStatus,
    /// Agent messages of this call, joined by newlines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<String>,
    pub awaiting_input: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff: Option<Handoff>,
    /// Operator diagnostic for failed sessions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureCause>,
}

/// Drives sessions of the flows in a catalog
pub struct FlowEngine {
    catalog: FlowCatalog,
    registry: ExecutorRegistry,
    services: Services,
    store: Arc<dyn SessionStore>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FlowEngine {
    pub fn new(catalog: FlowCatalog, services: Services, store: Arc<dyn SessionStore>) -> Self {
        Self {
            catalog,
            registry: ExecutorRegistry::with_defaults(),
            services,
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the executor registry
    pub fn with_registry(mut self, registry: ExecutorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn catalog(&self) -> &FlowCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Start a session (no `session_id`) or resume a waiting one
    pub async fn advance(
        &self,
        flow_id: &str,
        session_id: Option<&str>,
        input: Option<ExternalInput>,
    ) -> Result<AdvanceResponse, ParleyError> {
        self.advance_at(flow_id, session_id, input, Utc::now()).await
    }

    async fn advance_at(
        &self,
        flow_id: &str,
        session_id: Option<&str>,
        input: Option<ExternalInput>,
        now: DateTime<Utc>,
    ) -> Result<AdvanceResponse, ParleyError> {
        let graph = self
            .catalog
            .get(flow_id)
            .ok_or_else(|| ParleyError::FlowNotFound(flow_id.to_string()))?;

        match session_id {
            None => self.start(graph, input, now).await,
            Some(id) => self.resume(graph, id, input, now).await,
        }
    }

    async fn start(
        &self,
        graph: Arc<FlowGraph>,
        input: Option<ExternalInput>,
        now: DateTime<Utc>,
    ) -> Result<AdvanceResponse, ParleyError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let (strategy, reason) = strategy::select(&graph, &self.registry);
        log::info!(
            "[{}] Starting flow '{}' with {} strategy ({})",
            session_id,
            graph.id(),
            strategy,
            reason
        );

        let _guard = self.lock(&session_id).await;
        let meta = SessionMeta::new(&session_id, graph.id(), strategy);
        self.store.create(&meta).await?;

        let session = Session {
            meta,
            context: ExecutionContext::new(),
        };
        let start = runner::start_delta(&graph, strategy);
        self.drive(&graph, session, Some(start), input.as_ref(), now)
            .await
    }

    async fn resume(
        &self,
        graph: Arc<FlowGraph>,
        session_id: &str,
        input: Option<ExternalInput>,
        now: DateTime<Utc>,
    ) -> Result<AdvanceResponse, ParleyError> {
        let _guard = self.lock(session_id).await;
        let mut session = self.load(session_id).await?;
        if session.meta.flow_id != graph.id() {
            return Err(ParleyError::FlowMismatch {
                session_id: session_id.to_string(),
                requested: graph.id().to_string(),
                actual: session.meta.flow_id.clone(),
            });
        }

        let lifecycle = match session.status() {
            SessionStatus::Waiting => {
                if self.idle_expired(&graph, &session.meta, now) {
                    log::info!("[{}] Idle timeout reached", session_id);
                    return self.expire(session).await;
                }
                Some(runner::resume_delta())
            }
            SessionStatus::Running => {
                log::warn!("[{}] Recovering an interrupted run", session_id);
                None
            }
            SessionStatus::Pending => Some(runner::start_delta(&graph, session.meta.strategy)),
            status => {
                return Err(ParleyError::SessionNotWaiting {
                    session_id: session_id.to_string(),
                    status,
                })
            }
        };

        let is_user_input = input.as_ref().is_some_and(|i| !i.is_timeout());
        if is_user_input {
            session.meta.last_input_at = now;
        }
        self.drive(&graph, session, lifecycle, input.as_ref(), now)
            .await
    }

    /// Run the session and persist the result
    async fn drive(
        &self,
        graph: &FlowGraph,
        session: Session,
        lifecycle: Option<Delta>,
        input: Option<&ExternalInput>,
        now: DateTime<Utc>,
    ) -> Result<AdvanceResponse, ParleyError> {
        let Session {
            mut meta,
            mut context,
        } = session;
        let start_seq = context.last_seq();

        let env = RunEnv {
            session_id: &meta.session_id,
            graph,
            registry: &self.registry,
            services: &self.services,
            now,
        };
        let mut recorder = Recorder::new(&meta.session_id, &mut context, self.store.as_ref());
        if let Some(delta) = lifecycle {
            recorder.commit(delta).await?;
        }

        let failure = match runner::run(meta.strategy, &env, &mut recorder, input).await {
            Ok(report) => {
                log::debug!(
                    "[{}] Advance took {} steps, {} deltas",
                    meta.session_id,
                    report.steps,
                    recorder.committed()
                );
                None
            }
            Err(ParleyError::Store(e)) => return Err(ParleyError::Store(e)),
            Err(e) => Some(e),
        };
        let messages = recorder.outbound().to_vec();
        if let Some(e) = &failure {
            log::warn!("[{}] Advance ended in failure: {}", meta.session_id, e);
        }

        self.persist(&mut meta, &context, start_seq).await?;
        Ok(self.respond(&meta, &context, messages))
    }

    /// Snapshot, meta and archive bookkeeping after a change
    async fn persist(
        &self,
        meta: &mut SessionMeta,
        context: &ExecutionContext,
        start_seq: u64,
    ) -> Result<(), ParleyError> {
        let interval = self.services.config.snapshot_interval;
        let crossed = interval > 0 && context.last_seq() / interval > start_seq / interval;
        if crossed || context.status() == SessionStatus::Waiting {
            self.store.snapshot(&meta.session_id, context).await?;
        }

        meta.sync(context);
        self.store.save_meta(meta).await?;

        if context.status().is_terminal() {
            self.store.archive(&meta.session_id).await?;
            meta.archived = true;
            self.locks.lock().await.remove(&meta.session_id);
            log::info!("[{}] Session {} and archived", meta.session_id, context.status());
        }
        Ok(())
    }

    fn respond(
        &self,
        meta: &SessionMeta,
        context: &ExecutionContext,
        mut messages: Vec<String>,
    ) -> AdvanceResponse {
        let error = context.failure().cloned();
        if context.status() == SessionStatus::Failed {
            messages.push(self.services.config.failure_message.clone());
        }
        AdvanceResponse {
            session_id: meta.session_id.clone(),
            status: context.status(),
            outbound_message: (!messages.is_empty()).then(|| messages.join("\n")),
            messages,
            awaiting_input: context.status() == SessionStatus::Waiting,
            handoff: context.handoff().cloned(),
            error,
        }
    }

    /// Force a waiting session into `timeout`
    async fn expire(&self, session: Session) -> Result<AdvanceResponse, ParleyError> {
        let mut delta = Delta::new(None);
        delta.clear_await().set_status(SessionStatus::Timeout);
        self.close(session, delta).await
    }

    /// Commit a lifecycle delta that ends the session
    async fn close(&self, session: Session, delta: Delta) -> Result<AdvanceResponse, ParleyError> {
        let Session {
            mut meta,
            mut context,
        } = session;
        let start_seq = context.last_seq();
        let mut recorder = Recorder::new(&meta.session_id, &mut context, self.store.as_ref());
        recorder.commit(delta).await?;
        let messages = recorder.outbound().to_vec();

        self.persist(&mut meta, &context, start_seq).await?;
        Ok(self.respond(&meta, &context, messages))
    }

    /// Cancel a session from any non-terminal status; its log is kept
    pub async fn cancel(&self, session_id: &str) -> Result<AdvanceResponse, ParleyError> {
        let _guard = self.lock(session_id).await;
        let session = self.load(session_id).await?;
        let status = session.status();
        if status.is_terminal() {
            return Err(StateError::IllegalTransition {
                from: status,
                to: SessionStatus::Cancelled,
            }
            .into());
        }
        log::info!("[{}] Cancelling from {}", session_id, status);
        let mut delta = Delta::new(None);
        delta.clear_await().set_status(SessionStatus::Cancelled);
        self.close(session, delta).await
    }

    /// Current state of a session
    pub async fn session(&self, session_id: &str) -> Result<Session, ParleyError> {
        self.load(session_id).await
    }

    /// Full delta log of a session
    pub async fn history(&self, session_id: &str) -> Result<Vec<Delta>, ParleyError> {
        Ok(self.store.log(session_id).await?)
    }

    /// Fire passed wait deadlines and idle timeouts of waiting sessions
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<AdvanceResponse>, ParleyError> {
        let mut fired = Vec::new();
        for meta in self.store.list_waiting().await? {
            let Some(graph) = self.catalog.get(&meta.flow_id) else {
                log::warn!(
                    "[{}] Skipping sweep, flow '{}' is not loaded",
                    meta.session_id,
                    meta.flow_id
                );
                continue;
            };

            let deadline_passed = meta.deadline.is_some_and(|d| d <= now);
            let result = if deadline_passed {
                log::info!("[{}] Wait deadline passed", meta.session_id);
                let input = ExternalInput::event(TIMEOUT_EVENT, None);
                self.advance_at(&meta.flow_id, Some(&meta.session_id), Some(input), now)
                    .await
            } else if self.idle_expired(&graph, &meta, now) {
                self.expire_idle(&meta.session_id, now).await
            } else {
                continue;
            };

            match result {
                Ok(response) => fired.push(response),
                // another caller may have resumed it meanwhile
                Err(ParleyError::SessionNotWaiting { .. }) => {}
                Err(e) => log::error!("[{}] Sweep failed: {}", meta.session_id, e),
            }
        }
        Ok(fired)
    }

    async fn expire_idle(&self, session_id: &str, now: DateTime<Utc>) -> Result<AdvanceResponse, ParleyError> {
        let _guard = self.lock(session_id).await;
        let session = self.load(session_id).await?;
        if session.status() != SessionStatus::Waiting {
            return Err(ParleyError::SessionNotWaiting {
                session_id: session_id.to_string(),
                status: session.status(),
            });
        }
        let graph = self
            .catalog
            .get(&session.meta.flow_id)
            .ok_or_else(|| ParleyError::FlowNotFound(session.meta.flow_id.clone()))?;
        if !self.idle_expired(&graph, &session.meta, now) {
            return Ok(self.respond(&session.meta, &session.context, Vec::new()));
        }
        log::info!("[{}] Idle timeout reached", session_id);
        self.expire(session).await
    }

    fn idle_expired(&self, graph: &FlowGraph, meta: &SessionMeta, now: DateTime<Utc>) -> bool {
        self.services
            .config
            .idle_timeout_for(graph.metadata())
            .is_some_and(|idle| now - meta.last_input_at >= idle)
    }

    async fn load(&self, session_id: &str) -> Result<Session, ParleyError> {
        self.store
            .load(session_id)
            .await?
            .ok_or_else(|| ParleyError::SessionNotFound(session_id.to_string()))
    }

    async fn lock(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(session_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}
