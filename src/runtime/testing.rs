//! Mock collaborators for testing
//!
//! These let the orchestrator and the HTTP layer run end to end without a
//! reasoner or tool service.

use super::traits::*;
use super::{Collaborators, MemoryStore, Timeouts, TurnHandle, TurnOrchestrator};
use crate::access::{AccessGate, Authorized, Identity, Resolution};
use crate::audit::AuditRecord;
use crate::cache::MemoryCache;
use crate::db::{
    CheckpointSummary, DbError, DbResult, Entry, ResumedCheckpoint, TurnRecord, TurnState,
    TurnStatus, Usage,
};
use crate::state_machine::ToolCall;
use crate::transport::TurnEvent;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Recording Audit Sink
// ============================================================================

#[derive(Default)]
pub struct RecordingAudit {
    records: Mutex<Vec<AuditRecord>>,
}

impl RecordingAudit {
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.action).collect()
    }
}

impl AuditSink for RecordingAudit {
    fn record(&self, record: AuditRecord) {
        self.records.lock().unwrap().push(record);
    }
}

// ============================================================================
// Scripted Reasoner
// ============================================================================

enum Step {
    Reply { deltas: Vec<String>, text: String },
    Call(ToolCall),
    Fail(String),
}

/// Reasoner that plays back queued replies in order
#[derive(Default)]
pub struct ScriptedReasoner {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<ReasonerRequest>>,
}

pub fn test_usage() -> Usage {
    Usage {
        input_tokens: 10,
        output_tokens: 5,
    }
}

impl ScriptedReasoner {
    /// Queue a final reply sent without deltas
    pub fn reply(&self, text: &str) {
        self.push(Step::Reply {
            deltas: Vec::new(),
            text: text.to_string(),
        });
    }

    /// Queue a final reply streamed as the given deltas
    pub fn stream(&self, deltas: &[&str]) {
        self.push(Step::Reply {
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
            text: deltas.concat(),
        });
    }

    pub fn call_tool(&self, id: &str, name: &str, arguments: Value) {
        self.push(Step::Call(ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }));
    }

    pub fn fail(&self, message: &str) {
        self.push(Step::Fail(message.to_string()));
    }

    pub fn requests(&self) -> Vec<ReasonerRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn push(&self, step: Step) {
        self.steps.lock().unwrap().push_back(step);
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn invoke(
        &self,
        request: &ReasonerRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<ReasonerOutput, InvocationError> {
        self.requests.lock().unwrap().push(request.clone());
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Reply { deltas: parts, text }) => {
                for part in parts {
                    if deltas.send(part).await.is_err() {
                        return Err(InvocationError::reasoner("listener went away"));
                    }
                }
                Ok(ReasonerOutput::Final {
                    text,
                    usage: test_usage(),
                    cacheable: true,
                })
            }
            Some(Step::Call(call)) => Ok(ReasonerOutput::ToolCall {
                call,
                usage: test_usage(),
            }),
            Some(Step::Fail(message)) => Err(InvocationError::reasoner(message)),
            None => Err(InvocationError::reasoner("no scripted reply queued")),
        }
    }
}

/// Reasoner that never answers (for cancellation and timeout testing)
#[derive(Default)]
pub struct StallingReasoner {
    /// Notified when an invocation starts
    pub started: Arc<Notify>,
}

#[async_trait]
impl Reasoner for StallingReasoner {
    async fn invoke(
        &self,
        _request: &ReasonerRequest,
        _deltas: mpsc::Sender<String>,
    ) -> Result<ReasonerOutput, InvocationError> {
        self.started.notify_one();
        std::future::pending().await
    }
}

// ============================================================================
// Mock Tool Executor
// ============================================================================

/// Tool executor with predefined outputs
#[derive(Default)]
pub struct MockTools {
    outputs: Mutex<HashMap<String, Value>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockTools {
    pub fn add_tool(&self, name: &str, output: Value) {
        self.outputs.lock().unwrap().insert(name.to_string(), output);
    }

    /// Recorded executions as (name, arguments)
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for MockTools {
    async fn run(
        &self,
        name: &str,
        arguments: &Value,
        _cancel: CancellationToken,
    ) -> Result<Value, InvocationError> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments.clone()));
        self.outputs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| InvocationError::tool(format!("unknown tool '{name}'")))
    }
}

/// Tool executor that runs until cancelled
#[derive(Default)]
pub struct StallingTools {
    /// Notified when a tool starts
    pub started: Arc<Notify>,
}

#[async_trait]
impl ToolExecutor for StallingTools {
    async fn run(
        &self,
        _name: &str,
        _arguments: &Value,
        cancel: CancellationToken,
    ) -> Result<Value, InvocationError> {
        self.started.notify_one();
        cancel.cancelled().await;
        Err(InvocationError::tool("cancelled"))
    }
}

// ============================================================================
// Failing Store
// ============================================================================

/// Memory store whose checkpoint appends fail once a fixed number have succeeded
pub struct FailingAppends {
    pub inner: MemoryStore,
    remaining: AtomicUsize,
}

impl FailingAppends {
    pub fn after(successes: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            remaining: AtomicUsize::new(successes),
        }
    }
}

#[async_trait]
impl ConversationStore for FailingAppends {
    async fn claim_conversation(&self, id: &str, owner_id: &str) -> DbResult<String> {
        self.inner.claim_conversation(id, owner_id).await
    }

    async fn conversation_owner(&self, id: &str) -> DbResult<Option<String>> {
        self.inner.conversation_owner(id).await
    }

    async fn delete_conversation(&self, id: &str) -> DbResult<()> {
        self.inner.delete_conversation(id).await
    }
}

#[async_trait]
impl TurnStore for FailingAppends {
    async fn save_turn(&self, turn: &TurnRecord) -> DbResult<()> {
        self.inner.save_turn(turn).await
    }

    async fn get_turn(&self, conversation_id: &str, turn_id: &str) -> DbResult<TurnRecord> {
        self.inner.get_turn(conversation_id, turn_id).await
    }

    async fn latest_turn(
        &self,
        conversation_id: &str,
        status: TurnStatus,
    ) -> DbResult<Option<TurnRecord>> {
        self.inner.latest_turn(conversation_id, status).await
    }
}

#[async_trait]
impl CheckpointStore for FailingAppends {
    async fn append(
        &self,
        conversation_id: &str,
        turn_id: &str,
        state: &TurnState,
        entries: &[Entry],
        parent_checkpoint_id: Option<&str>,
    ) -> DbResult<String> {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_err(|_| DbError::LockPoisoned)?;
        self.inner
            .append(conversation_id, turn_id, state, entries, parent_checkpoint_id)
            .await
    }

    async fn list(&self, conversation_id: &str) -> DbResult<Vec<CheckpointSummary>> {
        self.inner.list(conversation_id).await
    }

    async fn resume_from(
        &self,
        conversation_id: &str,
        checkpoint_id: &str,
    ) -> DbResult<ResumedCheckpoint> {
        self.inner.resume_from(conversation_id, checkpoint_id).await
    }

    async fn edit(
        &self,
        conversation_id: &str,
        checkpoint_id: &str,
        replacement: &[Entry],
    ) -> DbResult<String> {
        self.inner.edit(conversation_id, checkpoint_id, replacement).await
    }
}

// ============================================================================
// Harness
// ============================================================================

/// An orchestrator wired to mocks over the given store
pub struct Harness<S = MemoryStore> {
    pub orchestrator: Arc<TurnOrchestrator>,
    pub gate: Arc<AccessGate>,
    pub store: Arc<S>,
    pub reasoner: Arc<ScriptedReasoner>,
    pub tools: Arc<MockTools>,
    pub audit: Arc<RecordingAudit>,
}

impl Harness<MemoryStore> {
    pub fn new() -> Self {
        Self::over(Arc::new(MemoryStore::new()))
    }

    /// Use `reasoner` instead of the scripted one
    pub fn with_reasoner(reasoner: Arc<dyn Reasoner>) -> Self {
        Self::build(Arc::new(MemoryStore::new()), Some(reasoner), None)
    }

    /// Use `tools` instead of the mock executor
    pub fn with_tools(tools: Arc<dyn ToolExecutor>) -> Self {
        Self::build(Arc::new(MemoryStore::new()), None, Some(tools))
    }
}

impl<S: Storage + 'static> Harness<S> {
    pub fn over(store: Arc<S>) -> Self {
        Self::build(store, None, None)
    }

    fn build(
        store: Arc<S>,
        reasoner: Option<Arc<dyn Reasoner>>,
        tool_executor: Option<Arc<dyn ToolExecutor>>,
    ) -> Self {
        let scripted = Arc::new(ScriptedReasoner::default());
        let tools = Arc::new(MockTools::default());
        let audit = Arc::new(RecordingAudit::default());
        let reasoner: Arc<dyn Reasoner> = match reasoner {
            Some(reasoner) => reasoner,
            None => scripted.clone(),
        };
        let tool_executor: Arc<dyn ToolExecutor> = match tool_executor {
            Some(tool_executor) => tool_executor,
            None => tools.clone(),
        };
        let collaborators = Collaborators {
            reasoner,
            tools: tool_executor,
            cache: Arc::new(MemoryCache::new(64)),
            audit: audit.clone(),
        };
        let storage: Arc<dyn Storage> = store.clone();
        let orchestrator = TurnOrchestrator::new(
            storage,
            collaborators,
            Timeouts {
                reasoner: std::time::Duration::from_secs(5),
                tool: std::time::Duration::from_secs(5),
            },
        );
        let gate = AccessGate::new(store.clone(), audit.clone());
        Self {
            orchestrator: Arc::new(orchestrator),
            gate: Arc::new(gate),
            store,
            reasoner: scripted,
            tools,
            audit,
        }
    }

    /// Resolve `reference` for `user`, creating it when missing
    pub async fn auth(&self, user: &str, reference: &str) -> Authorized {
        self.gate
            .resolve(&identity(user), Some(reference), Resolution::CreateIfMissing)
            .await
            .unwrap()
    }
}

pub fn identity(user: &str) -> Identity {
    Identity {
        user_id: user.to_string(),
        roles: Vec::new(),
    }
}

/// Collect every event of a turn along with its settled record
pub async fn run_turn(handle: TurnHandle) -> (Vec<TurnEvent>, TurnRecord) {
    let TurnHandle {
        mut events,
        outcome,
        ..
    } = handle;
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        seen.push(event);
    }
    (seen, outcome.await.unwrap())
}

pub fn event_names(events: &[TurnEvent]) -> Vec<&'static str> {
    events.iter().map(TurnEvent::name).collect()
}

#[cfg(test)]
mod tests {
    use super::super::{InputEntry, TurnOptions, TurnRequest};
    use super::*;
    use crate::db::{ContentBlock, Role};
    use crate::error::TurnError;
    use crate::state_machine::state::rejected_payload;
    use crate::state_machine::{Decision, FailureKind, ToolDecision};
    use serde_json::json;
    use std::time::Duration;

    fn say(text: &str) -> TurnRequest {
        say_with(text, TurnOptions::default())
    }

    fn say_with(text: &str, options: TurnOptions) -> TurnRequest {
        TurnRequest::parse(vec![user(text)], options).unwrap()
    }

    fn user(text: &str) -> InputEntry {
        InputEntry::Message {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    fn decide(tool_call_id: &str, decision: Decision) -> TurnRequest {
        decide_with(tool_call_id, decision, TurnOptions::default())
    }

    fn decide_with(tool_call_id: &str, decision: Decision, options: TurnOptions) -> TurnRequest {
        TurnRequest::parse(
            vec![InputEntry::Decision(ToolDecision {
                tool_call_id: tool_call_id.to_string(),
                decision,
            })],
            options,
        )
        .unwrap()
    }

    fn texts(record: &TurnRecord) -> Vec<String> {
        record.entries.iter().filter_map(Entry::text).collect()
    }

    async fn interrupted_turn(harness: &Harness, auth: &Authorized) -> TurnRecord {
        harness
            .reasoner
            .call_tool("call_1", "update_order", json!({"id": 42, "qty": 1}));
        let handle = harness
            .orchestrator
            .submit(auth, say("Set qty to 2"))
            .await
            .unwrap();
        let (events, record) = run_turn(handle).await;
        assert_eq!(event_names(&events).last(), Some(&"turn.interrupted"));
        assert_eq!(record.status(), TurnStatus::Interrupted);
        record
    }

    // ------------------------------------------------------------------
    // Request parsing
    // ------------------------------------------------------------------

    #[test]
    fn parse_rejects_malformed_input() {
        let decision = || {
            InputEntry::Decision(ToolDecision {
                tool_call_id: "call_1".to_string(),
                decision: Decision::Accept,
            })
        };
        let branch = TurnOptions {
            previous_turn_id: Some("turn_1".to_string()),
            ..TurnOptions::default()
        };
        let cases: Vec<(Vec<InputEntry>, TurnOptions)> = vec![
            (vec![], TurnOptions::default()),
            (
                vec![InputEntry::Message {
                    role: Role::Assistant,
                    content: vec![ContentBlock::text("hi")],
                }],
                TurnOptions::default(),
            ),
            (
                vec![InputEntry::Message {
                    role: Role::User,
                    content: vec![],
                }],
                TurnOptions::default(),
            ),
            (vec![user("a"), decision()], TurnOptions::default()),
            (vec![decision(), decision()], TurnOptions::default()),
            (vec![decision()], branch),
            (
                vec![user("a")],
                TurnOptions {
                    previous_turn_id: Some("turn_1".to_string()),
                    checkpoint_id: Some("ckpt_1".to_string()),
                    ..TurnOptions::default()
                },
            ),
            (
                vec![InputEntry::Decision(ToolDecision {
                    tool_call_id: "call_1".to_string(),
                    decision: Decision::Edit {
                        arguments: json!([1, 2]),
                    },
                })],
                TurnOptions::default(),
            ),
            (
                vec![user("a")],
                TurnOptions {
                    tool_timeout: Some(Duration::ZERO),
                    ..TurnOptions::default()
                },
            ),
        ];
        for (input, options) in cases {
            let err = TurnRequest::parse(input, options).unwrap_err();
            assert!(matches!(err, TurnError::Validation(_)), "{err:?}");
        }
    }

    #[test]
    fn parse_accepts_messages_and_single_decision() {
        let request = TurnRequest::parse(vec![user("a"), user("b")], TurnOptions::default())
            .unwrap();
        let TurnRequest::Messages { entries, .. } = request else {
            panic!("expected messages");
        };
        assert_eq!(entries.len(), 2);
        assert_ne!(entries[0].id(), entries[1].id());

        assert!(decide("call_1", Decision::Accept).is_decision());
    }

    // ------------------------------------------------------------------
    // Turn lifecycle
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn streamed_reply_completes_turn() {
        let harness = Harness::new();
        let auth = harness.auth("alice", "orders").await;
        harness.reasoner.stream(&["Hel", "lo"]);

        let handle = harness.orchestrator.submit(&auth, say("Hi")).await.unwrap();
        let turn_id = handle.turn_id.clone();
        let (events, record) = run_turn(handle).await;

        assert_eq!(
            event_names(&events),
            vec![
                "turn.created",
                "turn.output_text.delta",
                "turn.output_text.delta",
                "turn.message",
                "turn.completed",
            ]
        );
        assert_eq!(record.id, turn_id);
        assert_eq!(record.status(), TurnStatus::Completed);
        assert_eq!(texts(&record), vec!["Hi", "Hello"]);
        assert_eq!(record.usage, test_usage());

        let stored = harness.store.get_turn("alice::orders", &turn_id).await.unwrap();
        assert_eq!(stored.status(), TurnStatus::Completed);

        let checkpoints = harness.store.list("alice::orders").await.unwrap();
        assert!(checkpoints.len() >= 2);
        assert_eq!(checkpoints[0].parent_id, None);
        for pair in checkpoints.windows(2) {
            assert_eq!(pair[1].parent_id.as_deref(), Some(pair[0].id.as_str()));
        }
        assert_eq!(
            stored.last_checkpoint_id.as_deref(),
            checkpoints.last().map(|c| c.id.as_str())
        );
        assert!(harness.audit.actions().contains(&"turn.complete".to_string()));
    }

    #[tokio::test]
    async fn follow_up_turn_continues_from_head() {
        let harness = Harness::new();
        let auth = harness.auth("alice", "chat").await;
        harness.reasoner.reply("r1");
        harness.reasoner.reply("r2");

        let first = harness.orchestrator.submit(&auth, say("one")).await.unwrap();
        let (_, first) = run_turn(first).await;
        let second = harness.orchestrator.submit(&auth, say("two")).await.unwrap();
        let (_, second) = run_turn(second).await;

        assert_eq!(second.previous_turn_id.as_deref(), Some(first.id.as_str()));
        assert_eq!(texts(&second), vec!["one", "r1", "two", "r2"]);
        assert_eq!(second.base_len, 2);
        assert_eq!(second.output().len(), 2);
    }

    #[tokio::test]
    async fn edit_decision_runs_tool_with_edited_arguments() {
        let harness = Harness::new();
        harness.tools.add_tool("update_order", json!({"ok": true}));
        let auth = harness.auth("alice", "orders").await;
        let interrupted = interrupted_turn(&harness, &auth).await;

        let interrupt = interrupted.state.interrupt().unwrap();
        assert_eq!(interrupt.tool_call_id, "call_1");
        assert_eq!(interrupt.action.name, "update_order");
        assert!(harness.tools.calls().is_empty());

        harness.reasoner.reply("Updated");
        let handle = harness
            .orchestrator
            .submit(
                &auth,
                decide(
                    "call_1",
                    Decision::Edit {
                        arguments: json!({"id": 42, "qty": 2}),
                    },
                ),
            )
            .await
            .unwrap();
        assert_eq!(handle.turn_id, interrupted.id);
        let (events, record) = run_turn(handle).await;

        assert_eq!(
            event_names(&events),
            vec!["turn.resumed", "turn.message", "turn.completed"]
        );
        assert_eq!(
            harness.tools.calls(),
            vec![("update_order".to_string(), json!({"id": 42, "qty": 2}))]
        );
        assert_eq!(record.status(), TurnStatus::Completed);
        assert_eq!(record.entries.len(), 4);
        assert!(matches!(
            &record.entries[2],
            Entry::ToolResult { tool_call_id, payload, is_error: false, .. }
                if tool_call_id == "call_1" && *payload == json!({"ok": true})
        ));
        assert_eq!(record.entries[3].text().as_deref(), Some("Updated"));
        // Usage covers both reasoner calls
        assert_eq!(record.usage.total_tokens(), 2 * test_usage().total_tokens());
    }

    #[tokio::test]
    async fn reject_decision_skips_tool() {
        let harness = Harness::new();
        harness.tools.add_tool("update_order", json!({"ok": true}));
        let auth = harness.auth("alice", "orders").await;
        interrupted_turn(&harness, &auth).await;

        harness.reasoner.reply("Left it alone");
        let handle = harness
            .orchestrator
            .submit(
                &auth,
                decide(
                    "call_1",
                    Decision::Reject {
                        message: Some("not today".to_string()),
                    },
                ),
            )
            .await
            .unwrap();
        let (_, record) = run_turn(handle).await;

        assert!(harness.tools.calls().is_empty());
        assert_eq!(record.status(), TurnStatus::Completed);
        assert!(matches!(
            &record.entries[2],
            Entry::ToolResult { payload, is_error: true, .. }
                if *payload == rejected_payload(Some("not today"))
        ));
    }

    #[tokio::test]
    async fn decision_without_pending_interrupt_conflicts() {
        let harness = Harness::new();
        let auth = harness.auth("alice", "orders").await;
        let err = harness
            .orchestrator
            .submit(&auth, decide("call_1", Decision::Accept))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TurnError::Conflict(_)), "{err:?}");
        assert!(harness.store.list("alice::orders").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn decision_for_wrong_call_leaves_turn_interrupted() {
        let harness = Harness::new();
        let auth = harness.auth("alice", "orders").await;
        let interrupted = interrupted_turn(&harness, &auth).await;
        let before = harness.store.list("alice::orders").await.unwrap().len();

        let err = harness
            .orchestrator
            .submit(&auth, decide("call_9", Decision::Accept))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TurnError::Conflict(_)), "{err:?}");

        let stored = harness
            .store
            .get_turn("alice::orders", &interrupted.id)
            .await
            .unwrap();
        assert_eq!(stored.status(), TurnStatus::Interrupted);
        assert_eq!(harness.store.list("alice::orders").await.unwrap().len(), before);
        assert!(harness.tools.calls().is_empty());
    }

    #[tokio::test]
    async fn new_message_supersedes_interrupted_turn() {
        let harness = Harness::new();
        let auth = harness.auth("alice", "orders").await;
        let interrupted = interrupted_turn(&harness, &auth).await;

        harness.reasoner.reply("Never mind then");
        let handle = harness
            .orchestrator
            .submit(&auth, say("Actually, forget it"))
            .await
            .unwrap();
        let (_, record) = run_turn(handle).await;
        assert_eq!(record.status(), TurnStatus::Completed);

        let old = harness
            .store
            .get_turn("alice::orders", &interrupted.id)
            .await
            .unwrap();
        assert_eq!(old.status(), TurnStatus::Failed);
        assert_eq!(old.state.error().unwrap().kind, FailureKind::Superseded);

        let err = harness
            .orchestrator
            .submit(&auth, decide("call_1", Decision::Accept))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TurnError::Conflict(_)));
    }

    #[tokio::test]
    async fn reasoner_failure_fails_turn() {
        let harness = Harness::new();
        let auth = harness.auth("alice", "orders").await;
        harness.reasoner.fail("overloaded");

        let handle = harness.orchestrator.submit(&auth, say("Hi")).await.unwrap();
        let (events, record) = run_turn(handle).await;

        assert_eq!(event_names(&events).last(), Some(&"turn.failed"));
        let error = record.state.error().unwrap();
        assert_eq!(error.kind, FailureKind::Invocation);
        assert!(error.message.contains("overloaded"));
        let stored = harness.store.get_turn("alice::orders", &record.id).await.unwrap();
        assert_eq!(stored.status(), TurnStatus::Failed);
    }

    #[tokio::test]
    async fn tool_failure_fails_turn() {
        let harness = Harness::new();
        let auth = harness.auth("alice", "orders").await;
        interrupted_turn(&harness, &auth).await;

        // No output registered for update_order
        let handle = harness
            .orchestrator
            .submit(&auth, decide("call_1", Decision::Accept))
            .await
            .unwrap();
        let (_, record) = run_turn(handle).await;
        assert_eq!(record.state.error().unwrap().kind, FailureKind::Invocation);
    }

    #[tokio::test]
    async fn reasoner_timeout_fails_turn() {
        let harness = Harness::with_reasoner(Arc::new(StallingReasoner::default()));
        let auth = harness.auth("alice", "orders").await;
        let options = TurnOptions {
            reasoner_timeout: Some(Duration::from_millis(50)),
            ..TurnOptions::default()
        };
        let handle = harness
            .orchestrator
            .submit(&auth, say_with("Hi", options))
            .await
            .unwrap();
        let (_, record) = run_turn(handle).await;
        let error = record.state.error().unwrap();
        assert_eq!(error.kind, FailureKind::Invocation);
        assert!(error.message.contains("timed out"));
    }

    // ------------------------------------------------------------------
    // Cancellation and ordering
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn cancel_stops_running_turn() {
        let reasoner = Arc::new(StallingReasoner::default());
        let harness = Harness::with_reasoner(reasoner.clone());
        let auth = harness.auth("alice", "orders").await;

        let handle = harness.orchestrator.submit(&auth, say("Hi")).await.unwrap();
        let waiter = tokio::spawn(run_turn(handle));
        reasoner.started.notified().await;

        assert!(harness.orchestrator.cancel(&auth));
        let (events, record) = waiter.await.unwrap();
        assert_eq!(event_names(&events).last(), Some(&"turn.failed"));
        assert_eq!(record.state.error().unwrap().kind, FailureKind::Cancelled);
        assert!(!harness.orchestrator.cancel(&auth));
    }

    #[tokio::test]
    async fn dropped_listener_cancels_turn() {
        let harness = Harness::new();
        let auth = harness.auth("alice", "orders").await;
        harness.reasoner.stream(&["a", "b"]);

        let handle = harness.orchestrator.submit(&auth, say("Hi")).await.unwrap();
        let TurnHandle {
            events, outcome, ..
        } = handle;
        drop(events);
        let record = outcome.await.unwrap();
        assert_eq!(record.state.error().unwrap().kind, FailureKind::Cancelled);
    }

    #[tokio::test]
    async fn silent_reasoner_stops_when_listener_leaves() {
        let reasoner = Arc::new(StallingReasoner::default());
        let harness = Harness::with_reasoner(reasoner.clone());
        let auth = harness.auth("alice", "orders").await;
        let options = TurnOptions {
            reasoner_timeout: Some(Duration::from_secs(60)),
            ..TurnOptions::default()
        };

        let handle = harness
            .orchestrator
            .submit(&auth, say_with("Hi", options))
            .await
            .unwrap();
        let TurnHandle {
            events, outcome, ..
        } = handle;
        reasoner.started.notified().await;
        drop(events);

        let record = tokio::time::timeout(Duration::from_secs(5), outcome)
            .await
            .expect("turn should stop once the listener is gone")
            .unwrap();
        assert_eq!(record.state.error().unwrap().kind, FailureKind::Cancelled);
        assert!(!harness.orchestrator.cancel(&auth));
        assert_eq!(harness.orchestrator.slot_count(), 0);
    }

    #[tokio::test]
    async fn silent_tool_stops_when_listener_leaves() {
        let tools = Arc::new(StallingTools::default());
        let harness = Harness::with_tools(tools.clone());
        let auth = harness.auth("alice", "orders").await;
        interrupted_turn(&harness, &auth).await;

        let handle = harness
            .orchestrator
            .submit(&auth, decide("call_1", Decision::Accept))
            .await
            .unwrap();
        let TurnHandle {
            events, outcome, ..
        } = handle;
        tools.started.notified().await;
        drop(events);

        let record = tokio::time::timeout(Duration::from_secs(5), outcome)
            .await
            .expect("turn should stop once the listener is gone")
            .unwrap();
        assert_eq!(record.state.error().unwrap().kind, FailureKind::Cancelled);
    }

    #[tokio::test]
    async fn tool_timeout_fails_resumed_turn() {
        let harness = Harness::with_tools(Arc::new(StallingTools::default()));
        let auth = harness.auth("alice", "orders").await;
        interrupted_turn(&harness, &auth).await;

        let options = TurnOptions {
            tool_timeout: Some(Duration::from_millis(50)),
            ..TurnOptions::default()
        };
        let handle = harness
            .orchestrator
            .submit(&auth, decide_with("call_1", Decision::Accept, options))
            .await
            .unwrap();
        let (events, record) = run_turn(handle).await;
        assert_eq!(event_names(&events).last(), Some(&"turn.failed"));
        let error = record.state.error().unwrap();
        assert_eq!(error.kind, FailureKind::Invocation);
        assert!(error.message.contains("timed out"), "{}", error.message);
    }

    #[tokio::test]
    async fn cancel_stops_running_tool() {
        let tools = Arc::new(StallingTools::default());
        let harness = Harness::with_tools(tools.clone());
        let auth = harness.auth("alice", "orders").await;
        interrupted_turn(&harness, &auth).await;

        let handle = harness
            .orchestrator
            .submit(&auth, decide("call_1", Decision::Accept))
            .await
            .unwrap();
        let waiter = tokio::spawn(run_turn(handle));
        tools.started.notified().await;
        assert!(harness.orchestrator.cancel(&auth));

        let (_, failed) = waiter.await.unwrap();
        assert_eq!(failed.state.error().unwrap().kind, FailureKind::Cancelled);

        // The failed snapshot holds a call that never got a result
        harness.reasoner.reply("ok");
        let options = TurnOptions {
            checkpoint_id: failed.last_checkpoint_id.clone(),
            ..TurnOptions::default()
        };
        let (_, record) = run_turn(
            harness
                .orchestrator
                .submit(&auth, say_with("Something else", options))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(texts(&record), vec!["Set qty to 2", "Something else", "ok"]);
        assert!(record
            .entries
            .iter()
            .all(|e| !matches!(e, Entry::ToolCall { .. })));
    }

    #[tokio::test]
    async fn failed_checkpoint_write_fails_turn() {
        let harness = Harness::over(Arc::new(FailingAppends::after(1)));
        let auth = harness.auth("alice", "orders").await;
        harness.reasoner.reply("r1");

        let handle = harness.orchestrator.submit(&auth, say("Hi")).await.unwrap();
        let (events, record) = run_turn(handle).await;

        assert_eq!(event_names(&events).last(), Some(&"turn.failed"));
        let error = record.state.error().unwrap();
        assert_eq!(error.kind, FailureKind::Internal);
        assert!(error.message.contains("failed to persist turn"), "{}", error.message);
        let kept = harness.store.inner.list("alice::orders").await.unwrap();
        assert_eq!(kept.len(), 1);
    }

    #[tokio::test]
    async fn submissions_to_one_conversation_run_in_order() {
        let harness = Harness::new();
        let auth = harness.auth("alice", "chat").await;
        harness.reasoner.reply("r1");
        harness.reasoner.reply("r2");

        let run = |text: &'static str| {
            let orchestrator = Arc::clone(&harness.orchestrator);
            let auth = auth.clone();
            async move {
                let handle = orchestrator.submit(&auth, say(text)).await.unwrap();
                run_turn(handle).await.1
            }
        };
        let (first, second) = tokio::join!(run("one"), run("two"));

        assert_eq!(second.previous_turn_id.as_deref(), Some(first.id.as_str()));
        assert_eq!(texts(&second), vec!["one", "r1", "two", "r2"]);
    }

    // ------------------------------------------------------------------
    // Branching
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn branch_from_previous_turn() {
        let harness = Harness::new();
        let auth = harness.auth("alice", "chat").await;
        for reply in ["r1", "r2", "r3"] {
            harness.reasoner.reply(reply);
        }
        let (_, a) = run_turn(harness.orchestrator.submit(&auth, say("one")).await.unwrap()).await;
        run_turn(harness.orchestrator.submit(&auth, say("two")).await.unwrap()).await;

        let options = TurnOptions {
            previous_turn_id: Some(a.id.clone()),
            ..TurnOptions::default()
        };
        let (_, c) = run_turn(
            harness
                .orchestrator
                .submit(&auth, say_with("three", options))
                .await
                .unwrap(),
        )
        .await;

        assert_eq!(c.previous_turn_id.as_deref(), Some(a.id.as_str()));
        assert_eq!(texts(&c), vec!["one", "r1", "three", "r3"]);
        let last_request = harness.reasoner.requests().pop().unwrap();
        assert_eq!(last_request.entries.len(), 3);
    }

    #[tokio::test]
    async fn branch_from_foreign_turn_conflicts() {
        let harness = Harness::new();
        let first = harness.auth("alice", "one").await;
        let other = harness.auth("alice", "two").await;
        harness.reasoner.reply("r1");
        let (_, a) = run_turn(harness.orchestrator.submit(&first, say("hi")).await.unwrap()).await;

        let options = TurnOptions {
            previous_turn_id: Some(a.id),
            ..TurnOptions::default()
        };
        let err = harness
            .orchestrator
            .submit(&other, say_with("hi", options))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TurnError::Conflict(_)), "{err:?}");
    }

    #[tokio::test]
    async fn branch_from_interrupted_turn_drops_pending_call() {
        let harness = Harness::new();
        let auth = harness.auth("alice", "orders").await;
        let interrupted = interrupted_turn(&harness, &auth).await;

        harness.reasoner.reply("ok");
        let options = TurnOptions {
            previous_turn_id: Some(interrupted.id.clone()),
            ..TurnOptions::default()
        };
        let (_, record) = run_turn(
            harness
                .orchestrator
                .submit(&auth, say_with("Something else", options))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(texts(&record), vec!["Set qty to 2", "Something else", "ok"]);
        assert!(record
            .entries
            .iter()
            .all(|e| !matches!(e, Entry::ToolCall { .. })));
    }

    #[tokio::test]
    async fn branch_from_checkpoint() {
        let harness = Harness::new();
        let auth = harness.auth("alice", "chat").await;
        for reply in ["r1", "r2", "r3"] {
            harness.reasoner.reply(reply);
        }
        let (_, a) = run_turn(harness.orchestrator.submit(&auth, say("one")).await.unwrap()).await;
        run_turn(harness.orchestrator.submit(&auth, say("two")).await.unwrap()).await;

        let checkpoint = a.last_checkpoint_id.clone().unwrap();
        let options = TurnOptions {
            checkpoint_id: Some(checkpoint.clone()),
            ..TurnOptions::default()
        };
        let (_, c) = run_turn(
            harness
                .orchestrator
                .submit(&auth, say_with("three", options))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(texts(&c), vec!["one", "r1", "three", "r3"]);

        let checkpoints = harness.store.list("alice::chat").await.unwrap();
        let first_of_c = checkpoints.iter().find(|s| s.turn_id == c.id).unwrap();
        assert_eq!(first_of_c.parent_id.as_deref(), Some(checkpoint.as_str()));
    }

    #[tokio::test]
    async fn unknown_checkpoint_is_not_found() {
        let harness = Harness::new();
        let auth = harness.auth("alice", "chat").await;
        let options = TurnOptions {
            checkpoint_id: Some("ckpt_missing".to_string()),
            ..TurnOptions::default()
        };
        let err = harness
            .orchestrator
            .submit(&auth, say_with("hi", options))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TurnError::NotFound(_)), "{err:?}");
    }

    // ------------------------------------------------------------------
    // Storage and cache switches
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn unstored_turn_leaves_no_trace() {
        let harness = Harness::new();
        let auth = harness.auth("alice", "scratch").await;
        harness.reasoner.reply("temporary");
        let options = TurnOptions {
            store: false,
            ..TurnOptions::default()
        };

        let handle = harness
            .orchestrator
            .submit(&auth, say_with("Hi", options))
            .await
            .unwrap();
        let (events, record) = run_turn(handle).await;
        assert_eq!(event_names(&events).last(), Some(&"turn.completed"));
        assert_eq!(record.status(), TurnStatus::Completed);
        assert!(!record.store);

        assert_eq!(harness.store.turn_count(), 0);
        assert!(harness.store.list("alice::scratch").await.unwrap().is_empty());
        let err = harness.orchestrator.turn(&auth, &record.id).await.unwrap_err();
        assert!(matches!(err, TurnError::NotFound(_)));
    }

    #[tokio::test]
    async fn unstored_interrupted_turn_can_be_resumed() {
        let harness = Harness::new();
        harness.tools.add_tool("lookup", json!({"found": 1}));
        let auth = harness.auth("alice", "scratch").await;
        harness.reasoner.call_tool("call_1", "lookup", json!({}));
        harness.reasoner.reply("found it");
        let options = TurnOptions {
            store: false,
            ..TurnOptions::default()
        };

        let handle = harness
            .orchestrator
            .submit(&auth, say_with("find", options))
            .await
            .unwrap();
        let (_, interrupted) = run_turn(handle).await;
        assert_eq!(interrupted.status(), TurnStatus::Interrupted);
        let visible = harness.orchestrator.turn(&auth, &interrupted.id).await.unwrap();
        assert_eq!(visible.status(), TurnStatus::Interrupted);

        let handle = harness
            .orchestrator
            .submit(&auth, decide("call_1", Decision::Accept))
            .await
            .unwrap();
        let (_, record) = run_turn(handle).await;
        assert_eq!(record.status(), TurnStatus::Completed);
        assert_eq!(harness.store.turn_count(), 0);
    }

    #[tokio::test]
    async fn repeated_context_is_served_from_cache() {
        let harness = Harness::new();
        let first = harness.auth("alice", "one").await;
        let second = harness.auth("alice", "two").await;
        harness.reasoner.stream(&["hi ", "there"]);

        run_turn(harness.orchestrator.submit(&first, say("hello")).await.unwrap()).await;
        let (events, record) =
            run_turn(harness.orchestrator.submit(&second, say("hello")).await.unwrap()).await;

        assert_eq!(harness.reasoner.requests().len(), 1);
        assert_eq!(
            event_names(&events),
            vec!["turn.created", "turn.message", "turn.completed"]
        );
        assert_eq!(texts(&record), vec!["hello", "hi there"]);
        assert_eq!(record.usage, Usage::default());
    }

    #[tokio::test]
    async fn cache_is_scoped_per_user_and_switchable() {
        let harness = Harness::new();
        let alice = harness.auth("alice", "one").await;
        let bob = harness.auth("bob", "one").await;
        harness.reasoner.reply("for alice");
        harness.reasoner.reply("for bob");
        harness.reasoner.reply("fresh");

        run_turn(harness.orchestrator.submit(&alice, say("hello")).await.unwrap()).await;
        let (_, bobs) =
            run_turn(harness.orchestrator.submit(&bob, say("hello")).await.unwrap()).await;
        assert_eq!(texts(&bobs), vec!["hello", "for bob"]);

        let again = harness.auth("alice", "two").await;
        let options = TurnOptions {
            cache: false,
            ..TurnOptions::default()
        };
        let (_, fresh) = run_turn(
            harness
                .orchestrator
                .submit(&again, say_with("hello", options))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(texts(&fresh), vec!["hello", "fresh"]);
        assert_eq!(harness.reasoner.requests().len(), 3);
    }

    #[tokio::test]
    async fn delete_removes_conversation() {
        let harness = Harness::new();
        let auth = harness.auth("alice", "orders").await;
        harness.reasoner.reply("r1");
        run_turn(harness.orchestrator.submit(&auth, say("hi")).await.unwrap()).await;

        harness.orchestrator.delete(&auth).await.unwrap();
        assert_eq!(
            harness.store.conversation_owner("alice::orders").await.unwrap(),
            None
        );
        assert!(harness
            .audit
            .actions()
            .contains(&"conversation.delete".to_string()));

        let err = harness.orchestrator.delete(&auth).await.unwrap_err();
        assert!(matches!(err, TurnError::NotFound(_)));
    }

    #[tokio::test]
    async fn submission_queued_behind_delete_finds_nothing() {
        let reasoner = Arc::new(StallingReasoner::default());
        let harness = Harness::with_reasoner(reasoner.clone());
        let auth = harness.auth("alice", "orders").await;

        let running = harness.orchestrator.submit(&auth, say("Hi")).await.unwrap();
        let running = tokio::spawn(run_turn(running));
        reasoner.started.notified().await;

        let deleting = {
            let orchestrator = Arc::clone(&harness.orchestrator);
            let auth = auth.clone();
            tokio::spawn(async move { orchestrator.delete(&auth).await })
        };
        // The delete has cancelled the turn and queued on the conversation
        while !harness.audit.actions().contains(&"turn.cancel".to_string()) {
            tokio::task::yield_now().await;
        }

        let err = harness
            .orchestrator
            .submit(&auth, say("Again"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TurnError::NotFound(_)), "{err:?}");
        deleting.await.unwrap().unwrap();

        let (_, record) = running.await.unwrap();
        assert_eq!(record.state.error().unwrap().kind, FailureKind::Cancelled);
        assert_eq!(harness.orchestrator.slot_count(), 0);
    }

    #[tokio::test]
    async fn idle_conversations_release_their_slot() {
        let harness = Harness::new();
        let chat = harness.auth("alice", "chat").await;
        let scratch = harness.auth("alice", "scratch").await;
        harness.reasoner.reply("r1");
        run_turn(harness.orchestrator.submit(&chat, say("hi")).await.unwrap()).await;
        assert_eq!(harness.orchestrator.slot_count(), 0);

        // An unstored interrupted turn lives in the slot until resolved
        harness.reasoner.call_tool("call_1", "lookup", json!({}));
        let options = TurnOptions {
            store: false,
            ..TurnOptions::default()
        };
        run_turn(
            harness
                .orchestrator
                .submit(&scratch, say_with("find", options))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(harness.orchestrator.slot_count(), 1);

        let err = harness.orchestrator.turn(&chat, "turn_missing").await.unwrap_err();
        assert!(matches!(err, TurnError::NotFound(_)));
        assert_eq!(harness.orchestrator.slot_count(), 1);
    }
}
