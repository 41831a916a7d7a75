// SPDX-License-Identifier: MIT

//! Runtime state of one session

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::delta::{Delta, DeltaOp, Handoff};
use super::{SessionStatus, StateError, Turn, Variables};
use crate::parley::error::FailureCause;

/// Node the session is suspended on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Awaiting {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

/// Latest traversal of an exclusive group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupChoice {
    pub source: String,
    pub target: String,
}

/// Variables, history and position of one running session.
///
/// Fields are private: the context changes only through [`ExecutionContext::apply`],
/// so folding a session's delta log always reproduces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    status: SessionStatus,
    variables: Variables,
    history: Vec<Turn>,
    current_node: Option<String>,
    executed: BTreeSet<String>,
    awaiting: Option<Awaiting>,
    attempts: BTreeMap<String, u32>,
    pending: BTreeSet<String>,
    arrivals: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    choices: BTreeMap<String, GroupChoice>,
    handoff: Option<Handoff>,
    failure: Option<FailureCause>,
    last_seq: u64,
}

impl ExecutionContext {
    /// Create an empty context in `pending` status
    pub fn new() -> Self {
        Self {
            status: SessionStatus::Pending,
            variables: Variables::new(),
            history: Vec::new(),
            current_node: None,
            executed: BTreeSet::new(),
            awaiting: None,
            attempts: BTreeMap::new(),
            pending: BTreeSet::new(),
            arrivals: BTreeMap::new(),
            choices: BTreeMap::new(),
            handoff: None,
            failure: None,
            last_seq: 0,
        }
    }

    /// Rebuild a context by folding deltas in order
    pub fn replay<'a>(deltas: impl IntoIterator<Item = &'a Delta>) -> Result<Self, StateError> {
        let mut ctx = Self::new();
        ctx.replay_onto(deltas)?;
        Ok(ctx)
    }

    /// Fold further deltas onto this context (snapshot + tail)
    pub fn replay_onto<'a>(
        &mut self,
        deltas: impl IntoIterator<Item = &'a Delta>,
    ) -> Result<(), StateError> {
        for delta in deltas {
            self.apply(delta)?;
        }
        Ok(())
    }

    /// Apply one delta. Sequence numbers must be contiguous and status
    /// transitions legal; on error the context is left untouched.
    pub fn apply(&mut self, delta: &Delta) -> Result<(), StateError> {
        let expected = self.last_seq + 1;
        if delta.seq != expected {
            return Err(StateError::OutOfOrder {
                expected,
                found: delta.seq,
            });
        }

        // Check every status transition before touching anything
        let mut status = self.status;
        for op in &delta.ops {
            if let DeltaOp::SetStatus { status: next } = op {
                if !status.can_transition_to(*next) {
                    return Err(StateError::IllegalTransition {
                        from: status,
                        to: *next,
                    });
                }
                status = *next;
            }
        }

        for op in &delta.ops {
            self.apply_op(op);
        }
        self.last_seq = delta.seq;
        Ok(())
    }

    fn apply_op(&mut self, op: &DeltaOp) {
        match op {
            DeltaOp::SetVariable { key, value } => {
                self.variables.insert(key.clone(), value.clone());
            }
            DeltaOp::AppendTurn { turn } => self.history.push(turn.clone()),
            DeltaOp::SetStatus { status } => self.status = *status,
            DeltaOp::Route { targets, .. } => {
                if let [single] = targets.as_slice() {
                    self.current_node = Some(single.clone());
                }
            }
            DeltaOp::MarkExecuted { node_id } => {
                self.executed.insert(node_id.clone());
                self.pending.remove(node_id);
            }
            DeltaOp::SetAttempts { node_id, attempts } => {
                if *attempts == 0 {
                    self.attempts.remove(node_id);
                } else {
                    self.attempts.insert(node_id.clone(), *attempts);
                }
            }
            DeltaOp::AwaitInput { node_id, deadline } => {
                self.awaiting = Some(Awaiting {
                    node_id: node_id.clone(),
                    deadline: *deadline,
                });
            }
            DeltaOp::ClearAwait => self.awaiting = None,
            DeltaOp::Activate { node_id, from } => {
                if !self.executed.contains(node_id) {
                    self.pending.insert(node_id.clone());
                }
                let arrivals = self.arrivals.entry(node_id.clone()).or_default();
                if let Some(from) = from {
                    arrivals.insert(from.clone());
                }
            }
            DeltaOp::Choose {
                group,
                source,
                target,
            } => {
                self.choices.insert(
                    group.clone(),
                    GroupChoice {
                        source: source.clone(),
                        target: target.clone(),
                    },
                );
            }
            DeltaOp::Handoff { handoff } => self.handoff = Some(handoff.clone()),
            DeltaOp::Fail { cause } => self.failure = Some(cause.clone()),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    /// Get a variable value
    pub fn var(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    /// Get a nested variable using dot notation (e.g., "booking.slot")
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.variables.get(parts.next()?)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn current_node(&self) -> Option<&str> {
        self.current_node.as_deref()
    }

    pub fn executed(&self) -> &BTreeSet<String> {
        &self.executed
    }

    pub fn has_executed(&self, node_id: &str) -> bool {
        self.executed.contains(node_id)
    }

    pub fn awaiting(&self) -> Option<&Awaiting> {
        self.awaiting.as_ref()
    }

    /// True when the session is suspended on this node
    pub fn is_awaiting(&self, node_id: &str) -> bool {
        self.awaiting
            .as_ref()
            .map(|a| a.node_id == node_id)
            .unwrap_or(false)
    }

    /// Consecutive failed attempts recorded for a node
    pub fn attempts(&self, node_id: &str) -> u32 {
        self.attempts.get(node_id).copied().unwrap_or(0)
    }

    /// Staged mode: activated nodes that have not executed yet
    pub fn pending(&self) -> &BTreeSet<String> {
        &self.pending
    }

    /// Staged mode: sources whose edges reached this node
    pub fn arrivals(&self, node_id: &str) -> Option<&BTreeSet<String>> {
        self.arrivals.get(node_id)
    }

    /// Last member an exclusive group was routed to
    pub fn choice(&self, group: &str) -> Option<&GroupChoice> {
        self.choices.get(group)
    }

    pub fn handoff(&self) -> Option<&Handoff> {
        self.handoff.as_ref()
    }

    pub fn failure(&self) -> Option<&FailureCause> {
        self.failure.as_ref()
    }

    /// Sequence number of the last applied delta
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Variables as one JSON object
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adk::model::Role;
    use serde_json::json;

    fn committed(seq: u64, mut delta: Delta) -> Delta {
        delta.seq = seq;
        delta
    }

    #[test]
    fn test_empty_context() {
        let ctx = ExecutionContext::new();
        assert_eq!(ctx.status(), SessionStatus::Pending);
        assert!(ctx.var("anything").is_none());
        assert_eq!(ctx.last_seq(), 0);
    }

    #[test]
    fn test_last_write_wins() {
        let mut ctx = ExecutionContext::new();
        let mut d1 = Delta::new(None);
        d1.set_var("value", json!("first"));
        ctx.apply(&committed(1, d1)).unwrap();

        let mut d2 = Delta::new(None);
        d2.set_var("value", json!("second"));
        ctx.apply(&committed(2, d2)).unwrap();

        assert_eq!(ctx.var("value"), Some(&json!("second")));
    }

    #[test]
    fn test_out_of_order_delta_is_rejected() {
        let mut ctx = ExecutionContext::new();
        let err = ctx.apply(&committed(2, Delta::new(None))).unwrap_err();
        assert_eq!(
            err,
            StateError::OutOfOrder {
                expected: 1,
                found: 2
            }
        );
    }

    #[test]
    fn test_illegal_transition_leaves_context_untouched() {
        let mut ctx = ExecutionContext::new();
        let mut d = Delta::new(None);
        d.set_var("x", json!(1)).set_status(SessionStatus::Waiting);
        assert!(ctx.apply(&committed(1, d)).is_err());
        assert!(ctx.var("x").is_none());
        assert_eq!(ctx.last_seq(), 0);
    }

    #[test]
    fn test_route_moves_single_target_only() {
        let mut ctx = ExecutionContext::new();
        let mut d = Delta::new(None);
        d.route(vec!["entry".into()], None);
        ctx.apply(&committed(1, d)).unwrap();
        assert_eq!(ctx.current_node(), Some("entry"));

        let mut d = Delta::new(None);
        d.route(vec!["a".into(), "b".into()], None);
        ctx.apply(&committed(2, d)).unwrap();
        assert_eq!(ctx.current_node(), Some("entry"));
    }

    #[test]
    fn test_activation_and_execution_bookkeeping() {
        let mut ctx = ExecutionContext::new();
        let mut d = Delta::new(None);
        d.activate("join", Some("a")).activate("join", Some("b"));
        ctx.apply(&committed(1, d)).unwrap();
        assert!(ctx.pending().contains("join"));
        assert_eq!(ctx.arrivals("join").map(|s| s.len()), Some(2));

        let mut d = Delta::for_node("join");
        d.mark_executed("join");
        ctx.apply(&committed(2, d)).unwrap();
        assert!(!ctx.pending().contains("join"));
        assert!(ctx.has_executed("join"));

        // Activating an executed node does not re-queue it
        let mut d = Delta::new(None);
        d.activate("join", Some("c"));
        ctx.apply(&committed(3, d)).unwrap();
        assert!(ctx.pending().is_empty());
    }

    #[test]
    fn test_group_choice_is_replaced_by_later_traversal() {
        let mut ctx = ExecutionContext::new();
        let mut d = Delta::for_node("check");
        d.choose("check:exclusive", "check", "ask");
        ctx.apply(&committed(1, d)).unwrap();
        assert_eq!(ctx.choice("check:exclusive").unwrap().target, "ask");

        let mut d = Delta::for_node("check");
        d.choose("check:exclusive", "check", "done");
        ctx.apply(&committed(2, d)).unwrap();
        let choice = ctx.choice("check:exclusive").unwrap();
        assert_eq!((choice.source.as_str(), choice.target.as_str()), ("check", "done"));
        assert!(ctx.choice("other").is_none());
    }

    #[test]
    fn test_attempts_reset_on_zero() {
        let mut ctx = ExecutionContext::new();
        let mut d = Delta::new(None);
        d.set_attempts("ask", 2);
        ctx.apply(&committed(1, d)).unwrap();
        assert_eq!(ctx.attempts("ask"), 2);

        let mut d = Delta::new(None);
        d.set_attempts("ask", 0);
        ctx.apply(&committed(2, d)).unwrap();
        assert_eq!(ctx.attempts("ask"), 0);
    }

    #[test]
    fn test_replay_matches_incremental_application() {
        let mut log = Vec::new();
        let mut d = Delta::new(None);
        d.set_status(SessionStatus::Running)
            .route(vec!["entry".into()], None);
        log.push(committed(1, d));

        let mut d = Delta::for_node("ask");
        d.append_turn(Role::Agent, "Plate?", Some("ask"))
            .await_input("ask", None)
            .set_status(SessionStatus::Waiting)
            .mark_executed("ask");
        log.push(committed(2, d));

        let mut live = ExecutionContext::new();
        for delta in &log {
            live.apply(delta).unwrap();
        }
        let replayed = ExecutionContext::replay(&log).unwrap();

        assert_eq!(
            serde_json::to_vec(&live).unwrap(),
            serde_json::to_vec(&replayed).unwrap()
        );
        assert!(replayed.is_awaiting("ask"));
    }

    #[test]
    fn test_get_path() {
        let mut ctx = ExecutionContext::new();
        let mut d = Delta::new(None);
        d.set_var("result", json!({"data": {"value": 42}}));
        ctx.apply(&committed(1, d)).unwrap();

        assert_eq!(ctx.get_path("result.data.value"), Some(&json!(42)));
        assert_eq!(ctx.get_path("result.nonexistent"), None);
        assert_eq!(ctx.to_json()["result"]["data"]["value"], 42);
    }
}
