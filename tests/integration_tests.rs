// SPDX-License-Identifier: MIT

//! End-to-end tests driving `FlowEngine::advance` with mock collaborators

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parley_rs::adk::tool::{ToolContext, ToolExecutor, ToolResult};
use parley_rs::parley::flow::loader::{FlowCatalog, FlowLoader};
use parley_rs::parley::flow::nodes::{ExternalInput, Services};
use parley_rs::parley::flow::session::{FileSessionStore, MemorySessionStore, SessionStore};
use parley_rs::parley::flow::state::{Delta, DeltaOp, ExecutionContext, SessionStatus};
use parley_rs::parley::{EngineConfig, FailureKind, FlowEngine, ParleyError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Mock Components
// ============================================================================

/// Echoes its parameters; `delay_ms` slows a call down, unknown tools fail
#[derive(Default)]
struct MockTools {
    calls: AtomicUsize,
}

#[async_trait]
impl ToolExecutor for MockTools {
    async fn execute(&self, tool_name: &str, parameters: Value, _: &ToolContext) -> ToolResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ms) = parameters.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        match tool_name {
            "echo" => ToolResult::ok(parameters),
            "availability" => {
                let open = parameters["date"] != "2024-12-25";
                ToolResult::ok(json!({ "available": open }))
            }
            other => ToolResult::err(format!("{} is unavailable", other)),
        }
    }
}

static CONFIG: Lazy<Arc<EngineConfig>> = Lazy::new(|| Arc::new(EngineConfig::default()));

fn catalog(flows: &[&str]) -> FlowCatalog {
    let mut catalog = FlowCatalog::new();
    for yaml in flows {
        catalog.insert(FlowLoader::parse_yaml(yaml).unwrap());
    }
    catalog
}

fn engine_with(flows: &[&str], store: Arc<dyn SessionStore>) -> (FlowEngine, Arc<MockTools>) {
    let tools = Arc::new(MockTools::default());
    let services = Services::new(tools.clone(), CONFIG.clone());
    (FlowEngine::new(catalog(flows), services, store), tools)
}

fn engine(flows: &[&str]) -> FlowEngine {
    engine_with(flows, Arc::new(MemorySessionStore::new())).0
}

/// Sequence number of the first delta recorded by `node`
fn seq_of(log: &[Delta], node: &str) -> u64 {
    log.iter()
        .find(|d| d.node_id.as_deref() == Some(node))
        .map(|d| d.seq)
        .unwrap_or_else(|| panic!("no delta from '{}'", node))
}

// ============================================================================
// Flows
// ============================================================================

const BRANCH: &str = r#"
id: branch
nodes:
  - { id: start, type: entry }
  - { id: check, type: decision }
  - { id: a, type: end, message: "positive" }
  - { id: b, type: end, message: "not positive" }
edges:
  - { source: start, target: check }
  - { source: check, target: a, kind: exclusive, condition: "x > 0" }
  - { source: check, target: b, kind: exclusive, condition: "x <= 0" }
"#;

const PLATE: &str = r#"
id: plate
nodes:
  - { id: start, type: entry }
  - id: ask
    type: elicit
    prompt: "What is your licence plate?"
    retry_prompt: "Sorry, which plate?"
    max_retries: 2
    validator: { kind: pattern, regex: "^[A-Z]{1,3}-[A-Z]{1,2} [0-9]{1,4}$" }
  - { id: done, type: end, message: "Thanks, {{ask}}." }
  - { id: human, type: transfer, destination: front-desk, message: "Connecting you." }
edges:
  - { source: start, target: ask }
  - { source: ask, target: done }
  - { source: ask, target: human, kind: error }
"#;

const PAYMENT: &str = r#"
id: payment
nodes:
  - { id: start, type: entry }
  - id: pay
    type: wait
    event: payment_received
    timeout_secs: 60
    output_variable: receipt
    message: "Waiting for your payment, {{customer}}."
  - { id: paid, type: end, message: "Paid {{receipt.amount}} for {{customer}}." }
  - { id: late, type: end, message: "Payment window closed." }
edges:
  - { source: start, target: pay }
  - { source: pay, target: paid }
  - { source: pay, target: late, kind: timeout }
"#;

const FAN: &str = r#"
id: fan
metadata: { strategy: staged, max_fan_out: 3 }
nodes:
  - { id: start, type: entry }
  - { id: split, type: fan_out }
  - { id: slow, type: tool_call, tool: echo, parameters: { delay_ms: 80 } }
  - { id: medium, type: tool_call, tool: echo, parameters: { delay_ms: 40 } }
  - { id: fast, type: tool_call, tool: echo, parameters: { delay_ms: 0 } }
  - { id: join, type: fan_in, wait_for: all }
  - { id: done, type: end, message: "all three done" }
edges:
  - { source: start, target: split }
  - { source: split, target: slow, kind: parallel }
  - { source: split, target: medium, kind: parallel }
  - { source: split, target: fast, kind: parallel }
  - { source: slow, target: join }
  - { source: medium, target: join }
  - { source: fast, target: join }
  - { source: join, target: done }
"#;

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_decision_takes_only_the_true_branch() {
    let engine = engine(&[BRANCH]);
    let response = engine
        .advance("branch", None, Some(ExternalInput::payload(json!({"x": 5}))))
        .await
        .unwrap();

    assert_eq!(response.status, SessionStatus::Completed);
    assert_eq!(response.outbound_message.as_deref(), Some("positive"));

    let session = engine.session(&response.session_id).await.unwrap();
    assert!(session.context.has_executed("a"));
    assert!(!session.context.has_executed("b"));
}

#[tokio::test]
async fn test_retries_exhaust_on_third_failure() {
    let engine = engine(&[PLATE]);
    let first = engine.advance("plate", None, None).await.unwrap();
    let id = first.session_id.clone();
    assert_eq!(first.outbound_message.as_deref(), Some("What is your licence plate?"));

    for attempt in 1..=2 {
        let response = engine
            .advance("plate", Some(&id), Some(ExternalInput::text("no idea")))
            .await
            .unwrap();
        assert_eq!(response.status, SessionStatus::Waiting, "attempt {}", attempt);
        assert_eq!(response.outbound_message.as_deref(), Some("Sorry, which plate?"));
    }

    let third = engine
        .advance("plate", Some(&id), Some(ExternalInput::text("still no idea")))
        .await
        .unwrap();
    assert_eq!(third.status, SessionStatus::Completed);
    assert_eq!(third.outbound_message.as_deref(), Some("Connecting you."));
    assert_eq!(third.handoff.unwrap().destination, "front-desk");
}

#[tokio::test]
async fn test_valid_answer_after_retry() {
    let engine = engine(&[PLATE]);
    let id = engine.advance("plate", None, None).await.unwrap().session_id;
    engine
        .advance("plate", Some(&id), Some(ExternalInput::text("nope")))
        .await
        .unwrap();
    let done = engine
        .advance("plate", Some(&id), Some(ExternalInput::text("M-AB 123")))
        .await
        .unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.outbound_message.as_deref(), Some("Thanks, M-AB 123."));
}

#[tokio::test]
async fn test_wait_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    let id = {
        let store = Arc::new(FileSessionStore::open(dir.path()).await.unwrap());
        let (engine, _) = engine_with(&[PAYMENT], store);
        let start = ExternalInput::payload(json!({"customer": "Ada"}));
        let response = engine.advance("payment", None, Some(start)).await.unwrap();
        assert_eq!(response.status, SessionStatus::Waiting);
        assert_eq!(
            response.outbound_message.as_deref(),
            Some("Waiting for your payment, Ada.")
        );
        response.session_id
    };

    // a fresh engine over the same directory
    let store = Arc::new(FileSessionStore::open(dir.path()).await.unwrap());
    let (engine, _) = engine_with(&[PAYMENT], store);

    let unrelated = engine
        .advance("payment", Some(&id), Some(ExternalInput::event("refund", None)))
        .await
        .unwrap();
    assert_eq!(unrelated.status, SessionStatus::Waiting);

    let event = ExternalInput::event("payment_received", Some(json!({"amount": 42})));
    let response = engine.advance("payment", Some(&id), Some(event)).await.unwrap();
    assert_eq!(response.status, SessionStatus::Completed);
    assert_eq!(response.outbound_message.as_deref(), Some("Paid 42 for Ada."));

    let session = engine.session(&id).await.unwrap();
    assert_eq!(session.context.var("customer"), Some(&json!("Ada")));
    assert!(session.meta.archived);

    // snapshot plus tail and a full replay agree byte for byte
    let log = engine.history(&id).await.unwrap();
    let replayed = ExecutionContext::replay(&log).unwrap();
    assert_eq!(
        serde_json::to_vec(&replayed).unwrap(),
        serde_json::to_vec(&session.context).unwrap()
    );
}

#[tokio::test]
async fn test_join_applies_after_every_branch() {
    let (engine, tools) = engine_with(&[FAN], Arc::new(MemorySessionStore::new()));
    let response = engine.advance("fan", None, None).await.unwrap();
    assert_eq!(response.status, SessionStatus::Completed);
    assert_eq!(response.outbound_message.as_deref(), Some("all three done"));
    assert_eq!(tools.calls.load(Ordering::SeqCst), 3);

    let log = engine.history(&response.session_id).await.unwrap();
    let join = seq_of(&log, "join");
    for branch in ["slow", "medium", "fast"] {
        assert!(seq_of(&log, branch) < join, "{} after join", branch);
    }
    // branch deltas land in completion order
    assert!(seq_of(&log, "fast") < seq_of(&log, "slow"));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_deadline_sweep_follows_timeout_edge() {
    let engine = engine(&[PAYMENT]);
    let start = ExternalInput::payload(json!({"customer": "Bo"}));
    let id = engine
        .advance("payment", None, Some(start))
        .await
        .unwrap()
        .session_id;

    let fired = engine
        .sweep(chrono::Utc::now() + chrono::Duration::seconds(61))
        .await
        .unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].session_id, id);
    assert_eq!(fired[0].status, SessionStatus::Completed);
    assert_eq!(fired[0].outbound_message.as_deref(), Some("Payment window closed."));
}

#[tokio::test]
async fn test_tool_failure_fails_session_with_cause() {
    let broken = r#"
id: broken
nodes:
  - { id: start, type: entry }
  - { id: lookup, type: tool_call, tool: crm }
  - { id: done, type: end }
edges:
  - { source: start, target: lookup }
  - { source: lookup, target: done }
"#;
    let engine = engine(&[broken]);
    let response = engine.advance("broken", None, None).await.unwrap();
    assert_eq!(response.status, SessionStatus::Failed);
    let cause = response.error.unwrap();
    assert_eq!(cause.kind, FailureKind::Collaborator);
    assert!(cause.message.contains("crm is unavailable"));

    let log = engine.history(&response.session_id).await.unwrap();
    assert!(log
        .iter()
        .flat_map(|d| d.ops.iter())
        .any(|op| matches!(op, DeltaOp::Fail { .. })));
}

#[tokio::test]
async fn test_sessions_advance_independently() {
    let engine = engine(&[PLATE, BRANCH]);
    let (a, b) = tokio::join!(
        engine.advance("plate", None, None),
        engine.advance("branch", None, Some(ExternalInput::payload(json!({"x": -3})))),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.session_id, b.session_id);
    assert_eq!(a.status, SessionStatus::Waiting);
    assert_eq!(b.outbound_message.as_deref(), Some("not positive"));
}

#[tokio::test]
async fn test_session_belongs_to_its_flow() {
    let engine = engine(&[PLATE, BRANCH]);
    let id = engine.advance("plate", None, None).await.unwrap().session_id;
    let err = engine.advance("branch", Some(&id), None).await.unwrap_err();
    assert!(matches!(err, ParleyError::FlowMismatch { .. }));
}

#[tokio::test]
async fn test_cancel_then_advance_is_rejected() {
    let engine = engine(&[PLATE]);
    let id = engine.advance("plate", None, None).await.unwrap().session_id;
    let cancelled = engine.cancel(&id).await.unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);

    let err = engine
        .advance("plate", Some(&id), Some(ExternalInput::text("M-AB 1")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ParleyError::SessionNotWaiting {
            status: SessionStatus::Cancelled,
            ..
        }
    ));
}

// ============================================================================
// Shipped flows
// ============================================================================

fn shipped_flows() -> FlowCatalog {
    FlowLoader::new()
        .load_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/flows"))
        .unwrap()
}

#[test]
fn test_shipped_flows_load() {
    let catalog = shipped_flows();
    assert_eq!(catalog.ids().collect::<Vec<_>>(), vec!["booking", "intake"]);
}

#[tokio::test]
async fn test_booking_flow_end_to_end() {
    let services = Services::new(Arc::new(MockTools::default()), CONFIG.clone());
    let engine = FlowEngine::new(shipped_flows(), services, Arc::new(MemorySessionStore::new()));

    let id = engine.advance("booking", None, None).await.unwrap().session_id;
    let asked = engine
        .advance("booking", Some(&id), Some(ExternalInput::text("Ada")))
        .await
        .unwrap();
    assert!(asked.outbound_message.unwrap().contains("Ada"));

    let closed = engine
        .advance("booking", Some(&id), Some(ExternalInput::text("2024-12-25")))
        .await
        .unwrap();
    assert_eq!(closed.status, SessionStatus::Completed);
    assert_eq!(
        closed.outbound_message.as_deref(),
        Some("Sorry, 2024-12-25 is fully booked. Please call again for another day.")
    );
}
