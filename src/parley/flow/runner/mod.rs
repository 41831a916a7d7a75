// SPDX-License-Identifier: MIT

//! Runners drive a session forward until it suspends or terminates
//!
//! Both strategies share one commit path: a delta gets the next sequence
//! number, is applied to the in-memory context, then appended to the store.
//! Nothing else touches the context.

mod sequential;
mod staged;

pub use sequential::SequentialRunner;
pub use staged::StagedRunner;

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use super::condition;
use super::graph::{EdgeDefinition, FlowGraph, NodeDefinition, NodeType};
use super::nodes::{ExternalInput, NodeContext, Services};
use super::registry::ExecutorRegistry;
use super::session::SessionStore;
use super::state::{Delta, DeltaOp, ExecutionContext, SessionStatus, Variables};
use super::strategy::Strategy;
use crate::parley::error::ParleyError;

/// Read-only surroundings of one `advance` call
pub struct RunEnv<'a> {
    pub session_id: &'a str,
    pub graph: &'a FlowGraph,
    pub registry: &'a ExecutorRegistry,
    pub services: &'a Services,
    pub now: DateTime<Utc>,
}

impl<'a> RunEnv<'a> {
    pub(crate) fn node(&self, node_id: &str) -> Result<&'a NodeDefinition, ParleyError> {
        self.graph
            .node(node_id)
            .ok_or_else(|| ParleyError::NodeNotFound(node_id.to_string()))
    }

    pub(crate) fn node_context<'c>(
        &'c self,
        state: &'c ExecutionContext,
        input: Option<&'c ExternalInput>,
    ) -> NodeContext<'c> {
        NodeContext {
            session_id: self.session_id,
            graph: self.graph,
            state,
            input,
            services: self.services,
            now: self.now,
        }
    }

    pub(crate) fn max_steps(&self) -> usize {
        self.services.config.max_steps_per_advance
    }
}

/// Applies and persists deltas for one session, in order
pub struct Recorder<'a> {
    session_id: &'a str,
    context: &'a mut ExecutionContext,
    store: &'a dyn SessionStore,
    outbound: Vec<String>,
    committed: usize,
}

impl<'a> Recorder<'a> {
    pub fn new(
        session_id: &'a str,
        context: &'a mut ExecutionContext,
        store: &'a dyn SessionStore,
    ) -> Self {
        Self {
            session_id,
            context,
            store,
            outbound: Vec::new(),
            committed: 0,
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        self.context
    }

    /// Apply then persist. Empty deltas are skipped.
    pub async fn commit(&mut self, mut delta: Delta) -> Result<(), ParleyError> {
        if delta.is_empty() {
            return Ok(());
        }
        delta.seq = self.context.last_seq() + 1;
        self.context.apply(&delta)?;
        self.store.append(self.session_id, &delta).await?;

        self.outbound
            .extend(delta.agent_messages().map(str::to_string));
        self.committed += 1;
        log::debug!(
            "[{}] Committed delta #{} from {:?} ({} ops)",
            self.session_id,
            delta.seq,
            delta.node_id,
            delta.ops.len()
        );
        Ok(())
    }

    /// Record a fatal error on the session
    pub async fn fail(&mut self, node_id: Option<&str>, error: &ParleyError) -> Result<(), ParleyError> {
        log::error!(
            "[{}] Session failed at {:?}: {}",
            self.session_id,
            node_id,
            error
        );
        if self.context.status().is_terminal() {
            return Ok(());
        }
        let mut delta = Delta::new(node_id);
        delta
            .fail(error.to_cause(node_id))
            .set_status(SessionStatus::Failed);
        self.commit(delta).await
    }

    /// Agent messages committed through this recorder
    pub fn outbound(&self) -> &[String] {
        &self.outbound
    }

    pub fn committed(&self) -> usize {
        self.committed
    }
}

/// A fatal error plus the node it happened at
#[derive(Debug)]
pub struct RunFailure {
    pub node_id: Option<String>,
    pub error: ParleyError,
}

impl RunFailure {
    pub(crate) fn at(node_id: &str, error: impl Into<ParleyError>) -> Self {
        Self {
            node_id: Some(node_id.to_string()),
            error: error.into(),
        }
    }
}

impl From<ParleyError> for RunFailure {
    fn from(error: ParleyError) -> Self {
        Self {
            node_id: None,
            error,
        }
    }
}

/// One executed stage of the staged runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRecord {
    pub level: usize,
    /// Nodes queued in this stage; fresh for every stage
    pub scheduled: BTreeSet<String>,
    /// Members whose deltas were applied, in completion order
    pub completed: Vec<String>,
    /// Members that suspended and were held back
    pub deferred: Vec<String>,
}

/// What a run did
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Node executions (sequential) or stages (staged)
    pub steps: usize,
    pub stages: Vec<StageRecord>,
}

/// Run the session with the runner for `strategy`
///
/// A fatal error is recorded on the session as `failed` and the error is
/// returned for the caller's diagnostics; store failures are returned as is.
pub async fn run(
    strategy: Strategy,
    env: &RunEnv<'_>,
    recorder: &mut Recorder<'_>,
    input: Option<&ExternalInput>,
) -> Result<RunReport, ParleyError> {
    let result = match strategy {
        Strategy::Sequential => SequentialRunner.run(env, recorder, input).await,
        Strategy::Staged => StagedRunner.run(env, recorder, input).await,
    };

    match result {
        Ok(report) => Ok(report),
        Err(RunFailure {
            error: ParleyError::Store(e),
            ..
        }) => Err(ParleyError::Store(e)),
        Err(RunFailure { node_id, error }) => {
            recorder.fail(node_id.as_deref(), &error).await?;
            Err(error)
        }
    }
}

/// Whether `node` gets the caller's input: the suspended node does, and so
/// does the entry node on its first run.
pub(crate) fn takes_input(state: &ExecutionContext, node: &NodeDefinition) -> bool {
    state.is_awaiting(&node.id)
        || (node.node_type() == NodeType::Entry && !state.has_executed(&node.id))
}

/// A waiting outcome must leave the session `waiting`
pub(crate) fn ensure_waiting(delta: &mut Delta) {
    if delta.status().is_none() {
        delta.set_status(SessionStatus::Waiting);
    }
}

/// Record `from -> target` on each exclusive group the route belongs to
///
/// A group remembers the member it last went to. Sending it to a different
/// member fails, unless the node that chose before is choosing again, as
/// when a branch loops back through its decision.
pub(crate) fn choose_exclusive(
    graph: &FlowGraph,
    state: &ExecutionContext,
    from: &str,
    target: &str,
    delta: &mut Delta,
) -> Result<(), ParleyError> {
    for group in graph.exclusive_groups(from, target) {
        if let Some(previous) = state.choice(&group) {
            if previous.target != target && previous.source != from {
                return Err(ParleyError::routing(
                    from,
                    format!(
                        "exclusive group '{}' already went to '{}' from '{}'",
                        group, previous.target, previous.source
                    ),
                ));
            }
        }
        delta.choose(group, from, target);
    }
    Ok(())
}

/// Session variables as they will be once `delta` is applied
pub(crate) fn variables_after(state: &ExecutionContext, delta: &Delta) -> Variables {
    let mut vars = state.variables().clone();
    for op in &delta.ops {
        if let DeltaOp::SetVariable { key, value } = op {
            vars.insert(key.clone(), value.clone());
        }
    }
    vars
}

/// Evaluate an edge condition; an edge without one always holds
pub(crate) fn edge_holds(edge: &EdgeDefinition, vars: &Variables) -> Result<bool, ParleyError> {
    match &edge.condition {
        Some(source) => Ok(condition::check(source, vars)?),
        None => Ok(true),
    }
}

/// Label attached to a route, for the record
pub(crate) fn label_of(graph: &FlowGraph, from: &str, target: &str) -> Option<String> {
    graph
        .outgoing(from)
        .find(|e| e.target == target)
        .and_then(|e| e.label.clone())
}

pub(crate) fn is_terminal(delta: &Delta) -> bool {
    delta.status().is_some_and(|s| s.is_terminal())
}

/// Lifecycle delta that opens a session at the entry node
pub fn start_delta(graph: &FlowGraph, strategy: Strategy) -> Delta {
    let entry = graph.entry().id.clone();
    let mut delta = Delta::new(None);
    delta
        .set_status(SessionStatus::Running)
        .route(vec![entry.clone()], None);
    if strategy == Strategy::Staged {
        delta.activate(entry, None);
    }
    delta
}

/// Lifecycle delta that wakes a suspended session
pub fn resume_delta() -> Delta {
    let mut delta = Delta::new(None);
    delta.set_status(SessionStatus::Running);
    delta
}
