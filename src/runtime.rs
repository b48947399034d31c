//! Turn orchestration
//!
//! Accepts turn submissions, serializes them per conversation and hands each
//! one to a driver task. At most one turn is active per conversation;
//! further submissions wait their turn in arrival order.

mod executor;
mod memory;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use memory::MemoryStore;
pub use traits::*;

use crate::access::Authorized;
use crate::audit::AuditRecord;
use crate::db::{ContentBlock, Entry, Role, TurnRecord, TurnState, TurnStatus};
use crate::error::TurnError;
use crate::state_machine::{Event, FailureKind, ToolDecision, TurnContext};
use crate::transport::TurnEvent;
use chrono::Utc;
use executor::{TurnDriver, TurnSetup};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Events buffered between a driver and its listener
const EVENT_BUFFER: usize = 32;

/// External collaborators used by every turn
#[derive(Clone)]
pub struct Collaborators {
    pub reasoner: Arc<dyn Reasoner>,
    pub tools: Arc<dyn ToolExecutor>,
    pub cache: Arc<dyn ResponseCache>,
    pub audit: Arc<dyn AuditSink>,
}

/// Per-call limits for collaborator invocations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub reasoner: Duration,
    pub tool: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            reasoner: Duration::from_secs(120),
            tool: Duration::from_secs(60),
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// One item of caller input
#[derive(Debug, Clone, PartialEq)]
pub enum InputEntry {
    Message {
        role: Role,
        content: Vec<ContentBlock>,
    },
    Decision(ToolDecision),
}

/// Per-request switches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOptions {
    /// Branch from this turn instead of the conversation head
    pub previous_turn_id: Option<String>,
    /// Start from this checkpoint instead of the conversation head
    pub checkpoint_id: Option<String>,
    /// False keeps the turn and its checkpoints in memory only
    pub store: bool,
    pub cache: bool,
    pub reasoner_timeout: Option<Duration>,
    pub tool_timeout: Option<Duration>,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            previous_turn_id: None,
            checkpoint_id: None,
            store: true,
            cache: true,
            reasoner_timeout: None,
            tool_timeout: None,
        }
    }
}

/// A validated submission
#[derive(Debug, Clone)]
pub enum TurnRequest {
    /// New user messages starting a fresh turn
    Messages {
        entries: Vec<Entry>,
        options: TurnOptions,
    },
    /// Resolution of the conversation's pending tool call
    Decision {
        decision: ToolDecision,
        options: TurnOptions,
    },
}

impl TurnRequest {
    /// Check request shape without touching any state
    pub fn parse(input: Vec<InputEntry>, options: TurnOptions) -> Result<Self, TurnError> {
        if input.is_empty() {
            return Err(TurnError::validation("input must not be empty"));
        }
        if options.previous_turn_id.is_some() && options.checkpoint_id.is_some() {
            return Err(TurnError::validation(
                "previous_response_id and checkpoint_id cannot be combined",
            ));
        }
        for limit in [options.reasoner_timeout, options.tool_timeout]
            .into_iter()
            .flatten()
        {
            if limit.is_zero() {
                return Err(TurnError::validation("timeouts must be positive"));
            }
        }

        let mut entries = Vec::new();
        let mut decisions = Vec::new();
        for item in input {
            match item {
                InputEntry::Message { role, content } => {
                    if role != Role::User {
                        return Err(TurnError::validation(format!(
                            "input messages must have role 'user', got '{role}'"
                        )));
                    }
                    if content.is_empty() {
                        return Err(TurnError::validation("message content must not be empty"));
                    }
                    entries.push(Entry::Message {
                        id: crate::db::new_entry_id(),
                        role,
                        content,
                    });
                }
                InputEntry::Decision(decision) => decisions.push(decision),
            }
        }

        match (entries.is_empty(), decisions.len()) {
            (false, 0) => Ok(TurnRequest::Messages { entries, options }),
            (true, 1) => {
                let Some(decision) = decisions.pop() else {
                    return Err(TurnError::validation("input must not be empty"));
                };
                if options.previous_turn_id.is_some() || options.checkpoint_id.is_some() {
                    return Err(TurnError::validation(
                        "tool decisions resume the pending turn and cannot branch",
                    ));
                }
                if decision.tool_call_id.is_empty() {
                    return Err(TurnError::validation("tool_call_id must not be empty"));
                }
                decision
                    .decision
                    .validate()
                    .map_err(TurnError::Validation)?;
                Ok(TurnRequest::Decision { decision, options })
            }
            (true, _) => Err(TurnError::validation(
                "only one tool decision may be submitted at a time",
            )),
            (false, _) => Err(TurnError::validation(
                "messages and tool decisions cannot be mixed in one request",
            )),
        }
    }

    pub fn is_decision(&self) -> bool {
        matches!(self, TurnRequest::Decision { .. })
    }

    fn options(&self) -> &TurnOptions {
        match self {
            TurnRequest::Messages { options, .. } | TurnRequest::Decision { options, .. } => options,
        }
    }
}

// ============================================================================
// Handles
// ============================================================================

/// A running turn
pub struct TurnHandle {
    pub conversation_id: String,
    pub turn_id: String,
    /// Raw events in production order; dropping this cancels the turn
    pub events: mpsc::Receiver<TurnEvent>,
    outcome: JoinHandle<TurnRecord>,
}

impl TurnHandle {
    /// Keep only the event channel; the turn runs on unobserved
    pub fn into_events(self) -> mpsc::Receiver<TurnEvent> {
        self.events
    }

    /// Wait for the turn to settle, discarding events
    pub async fn finish(mut self) -> Result<TurnRecord, TurnError> {
        while self.events.recv().await.is_some() {}
        self.outcome.await.map_err(|e| {
            tracing::error!(error = %e, "Turn task failed");
            TurnError::Internal(format!("turn task failed: {e}"))
        })
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Per-conversation serialization point and in-memory turn storage
#[derive(Clone)]
struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    scratch: Arc<MemoryStore>,
}

/// State prepared under the conversation lock, ready to drive
struct Prepared {
    setup: TurnSetup,
    first: Event,
}

pub struct TurnOrchestrator {
    store: Arc<dyn Storage>,
    collaborators: Collaborators,
    timeouts: Timeouts,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    /// Cancellation tokens of active turns, by conversation
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl TurnOrchestrator {
    pub fn new(store: Arc<dyn Storage>, collaborators: Collaborators, timeouts: Timeouts) -> Self {
        Self {
            store,
            collaborators,
            timeouts,
            slots: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn slot(&self, conversation_id: &str) -> Result<Slot, TurnError> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| TurnError::Internal("conversation table lock poisoned".to_string()))?;
        Ok(slots
            .entry(conversation_id.to_string())
            .or_insert_with(|| Slot {
                lock: Arc::new(tokio::sync::Mutex::new(())),
                scratch: Arc::new(MemoryStore::new()),
            })
            .clone())
    }

    /// Submit input to a conversation.
    ///
    /// Waits for any active turn in the same conversation, then validates the
    /// request against current state and starts a driver task. Errors are
    /// returned before anything is written.
    pub async fn submit(
        &self,
        auth: &Authorized,
        request: TurnRequest,
    ) -> Result<TurnHandle, TurnError> {
        let conversation_id = auth.conversation_id().to_string();
        let slot = self.slot(&conversation_id)?;
        let guard = Arc::clone(&slot.lock).lock_owned().await;
        let prepared = match self.prepare(auth, &slot, request).await {
            Ok(prepared) => prepared,
            Err(e) => {
                drop(guard);
                drop(slot);
                release_idle_slot(&self.slots, &conversation_id);
                return Err(e);
            }
        };
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let Prepared { mut setup, first } = prepared;
        setup.events = Some(events_tx);
        let cancel = setup.cancel.clone();

        let turn_id = setup.record.id.clone();
        self.active
            .lock()
            .map_err(|_| TurnError::Internal("active turn table lock poisoned".to_string()))?
            .insert(conversation_id.clone(), cancel);

        let driver = TurnDriver::new(setup);
        let active = Arc::clone(&self.active);
        let slots = Arc::clone(&self.slots);
        let conv_id = conversation_id.clone();
        let outcome = tokio::spawn(async move {
            let record = driver.run(first).await;
            if let Ok(mut active) = active.lock() {
                active.remove(&conv_id);
            }
            if !record.store && record.status().is_terminal() {
                slot.scratch.forget_turn(&conv_id, &record.id);
            }
            drop(guard);
            drop(slot);
            release_idle_slot(&slots, &conv_id);
            record
        });

        Ok(TurnHandle {
            conversation_id,
            turn_id,
            events: events_rx,
            outcome,
        })
    }

    /// Validate `request` against current state; runs under the conversation lock
    async fn prepare(
        &self,
        auth: &Authorized,
        slot: &Slot,
        request: TurnRequest,
    ) -> Result<Prepared, TurnError> {
        let conversation_id = auth.conversation_id();
        // A delete may have run while this submission waited for the lock
        if self.store.conversation_owner(conversation_id).await?.is_none() {
            return Err(TurnError::NotFound(format!(
                "conversation '{conversation_id}' not found"
            )));
        }

        let options = request.options().clone();
        let timeouts = Timeouts {
            reasoner: options.reasoner_timeout.unwrap_or(self.timeouts.reasoner),
            tool: options.tool_timeout.unwrap_or(self.timeouts.tool),
        };
        let mut prepared = match request {
            TurnRequest::Messages { entries, options } => {
                self.prepare_messages(auth, slot, entries, &options).await?
            }
            TurnRequest::Decision { decision, options } => {
                self.prepare_decision(auth, slot, decision, &options).await?
            }
        };
        prepared.setup.timeouts = timeouts;
        prepared.setup.cancel = CancellationToken::new();
        Ok(prepared)
    }

    async fn prepare_messages(
        &self,
        auth: &Authorized,
        slot: &Slot,
        messages: Vec<Entry>,
        options: &TurnOptions,
    ) -> Result<Prepared, TurnError> {
        let conversation_id = auth.conversation_id();

        let (base, base_checkpoint_id, previous_turn_id) =
            if let Some(previous) = &options.previous_turn_id {
                let (turn, _) = self
                    .find_turn(slot, conversation_id, previous)
                    .await?
                    .ok_or_else(|| {
                        TurnError::conflict(format!(
                            "previous turn '{previous}' does not belong to this conversation"
                        ))
                    })?;
                let base = branch_history(&turn)?;
                (base, turn.last_checkpoint_id.clone(), Some(turn.id))
            } else if let Some(checkpoint_id) = &options.checkpoint_id {
                let resumed = self.store.resume_from(conversation_id, checkpoint_id).await?;
                let base = resolved_history(resumed.entries);
                (base, Some(resumed.summary.id), Some(resumed.summary.turn_id))
            } else {
                match self
                    .store
                    .latest_turn(conversation_id, TurnStatus::Completed)
                    .await?
                {
                    Some(head) => (head.entries, head.last_checkpoint_id, Some(head.id)),
                    None => (Vec::new(), None, None),
                }
            };

        let turn_id = format!("turn_{}", uuid::Uuid::new_v4().simple());
        for (stale, store) in self.interrupted_turns(slot, conversation_id).await? {
            self.close_superseded(auth, stale, store, &slot.scratch, &turn_id)
                .await;
        }

        let now = Utc::now();
        let base_len = base.len();
        let mut entries = base;
        entries.extend(messages);
        let record = TurnRecord {
            id: turn_id.clone(),
            conversation_id: conversation_id.to_string(),
            previous_turn_id: previous_turn_id.clone(),
            state: TurnState::Created,
            entries,
            base_len,
            usage: crate::db::Usage::default(),
            store: options.store,
            last_checkpoint_id: None,
            created_at: now,
            updated_at: now,
        };

        let mut context = TurnContext::new(conversation_id, &turn_id);
        context.previous_turn_id = previous_turn_id;
        context.cache_enabled = options.cache;

        let store: Arc<dyn Storage> = if options.store {
            Arc::clone(&self.store)
        } else {
            let scratch: Arc<dyn Storage> = slot.scratch.clone();
            scratch
        };
        Ok(Prepared {
            setup: self.setup(auth, context, record, store, base_checkpoint_id),
            first: Event::Start,
        })
    }

    async fn prepare_decision(
        &self,
        auth: &Authorized,
        slot: &Slot,
        decision: ToolDecision,
        options: &TurnOptions,
    ) -> Result<Prepared, TurnError> {
        let conversation_id = auth.conversation_id();
        let mut pending = self.interrupted_turns(slot, conversation_id).await?;
        let Some((turn, store)) = pending.pop() else {
            return Err(TurnError::conflict(
                "no tool call is awaiting a decision in this conversation",
            ));
        };
        let Some(interrupt) = turn.state.interrupt() else {
            return Err(TurnError::Internal(format!(
                "turn '{}' is not interrupted",
                turn.id
            )));
        };
        interrupt
            .check(&decision)
            .map_err(|mismatch| TurnError::conflict(mismatch.to_string()))?;

        let mut context = TurnContext::new(conversation_id, &turn.id);
        context.previous_turn_id = turn.previous_turn_id.clone();
        context.cache_enabled = options.cache;

        Ok(Prepared {
            setup: self.setup(auth, context, turn, store, None),
            first: Event::Decision { decision },
        })
    }

    fn setup(
        &self,
        auth: &Authorized,
        context: TurnContext,
        record: TurnRecord,
        store: Arc<dyn Storage>,
        base_checkpoint_id: Option<String>,
    ) -> TurnSetup {
        TurnSetup {
            context,
            record,
            identity: auth.identity().clone(),
            store,
            collaborators: self.collaborators.clone(),
            timeouts: self.timeouts,
            cancel: CancellationToken::new(),
            base_checkpoint_id,
            events: None,
        }
    }

    /// Look a turn up in memory first, then in durable storage
    async fn find_turn(
        &self,
        slot: &Slot,
        conversation_id: &str,
        turn_id: &str,
    ) -> Result<Option<(TurnRecord, Arc<dyn Storage>)>, TurnError> {
        match slot.scratch.get_turn(conversation_id, turn_id).await {
            Ok(turn) => {
                let scratch: Arc<dyn Storage> = slot.scratch.clone();
                return Ok(Some((turn, scratch)));
            }
            Err(crate::db::DbError::TurnNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        match self.store.get_turn(conversation_id, turn_id).await {
            Ok(turn) => Ok(Some((turn, Arc::clone(&self.store)))),
            Err(crate::db::DbError::TurnNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Turns waiting on a decision, durable ones first
    async fn interrupted_turns(
        &self,
        slot: &Slot,
        conversation_id: &str,
    ) -> Result<Vec<(TurnRecord, Arc<dyn Storage>)>, TurnError> {
        let mut found = Vec::new();
        if let Some(turn) = self
            .store
            .latest_turn(conversation_id, TurnStatus::Interrupted)
            .await?
        {
            found.push((turn, Arc::clone(&self.store)));
        }
        if let Some(turn) = slot
            .scratch
            .latest_turn(conversation_id, TurnStatus::Interrupted)
            .await?
        {
            let scratch: Arc<dyn Storage> = slot.scratch.clone();
            found.push((turn, scratch));
        }
        Ok(found)
    }

    /// Fail an interrupted turn that a newer submission replaces
    async fn close_superseded(
        &self,
        auth: &Authorized,
        turn: TurnRecord,
        store: Arc<dyn Storage>,
        scratch: &MemoryStore,
        by_turn_id: &str,
    ) {
        tracing::info!(
            conv_id = %turn.conversation_id,
            turn_id = %turn.id,
            by = %by_turn_id,
            "Superseding interrupted turn"
        );
        let mut context = TurnContext::new(&turn.conversation_id, &turn.id);
        context.previous_turn_id = turn.previous_turn_id.clone();
        let ephemeral = !turn.store;
        let driver = TurnDriver::new(self.setup(auth, context, turn, store, None));
        let closed = driver
            .run(Event::Aborted {
                kind: FailureKind::Superseded,
                message: format!("superseded by turn '{by_turn_id}'"),
            })
            .await;
        if ephemeral {
            scratch.forget_turn(&closed.conversation_id, &closed.id);
        }
    }

    /// Fetch a turn visible to the caller
    pub async fn turn(&self, auth: &Authorized, turn_id: &str) -> Result<TurnRecord, TurnError> {
        let slot = self.slot(auth.conversation_id())?;
        let found = self.find_turn(&slot, auth.conversation_id(), turn_id).await;
        drop(slot);
        release_idle_slot(&self.slots, auth.conversation_id());
        found?
            .map(|(turn, _)| turn)
            .ok_or_else(|| TurnError::NotFound(format!("turn '{turn_id}' not found")))
    }

    /// Cancel the conversation's active turn; returns whether one was running
    pub fn cancel(&self, auth: &Authorized) -> bool {
        let token = self
            .active
            .lock()
            .ok()
            .and_then(|active| active.get(auth.conversation_id()).cloned());
        let cancelled = match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        };
        self.collaborators.audit.record(AuditRecord::new(
            &auth.identity().user_id,
            "turn.cancel",
            auth.conversation_id(),
            if cancelled { "cancelled" } else { "idle" },
        ));
        cancelled
    }

    /// Delete a conversation after stopping its active turn
    pub async fn delete(&self, auth: &Authorized) -> Result<(), TurnError> {
        let conversation_id = auth.conversation_id();
        self.cancel(auth);
        let slot = self.slot(conversation_id)?;
        let guard = slot.lock.lock().await;
        let deleted = self.store.delete_conversation(conversation_id).await;
        if deleted.is_ok() {
            slot.scratch.clear();
        }
        drop(guard);
        drop(slot);
        release_idle_slot(&self.slots, conversation_id);
        deleted?;
        tracing::info!(conv_id = %conversation_id, "Deleted conversation");
        self.collaborators.audit.record(AuditRecord::new(
            &auth.identity().user_id,
            "conversation.delete",
            conversation_id,
            "deleted",
        ));
        Ok(())
    }
}

/// Forget a conversation's slot once no submission holds it and no scratch turn lives in it
fn release_idle_slot(slots: &Mutex<HashMap<String, Slot>>, conversation_id: &str) {
    let Ok(mut slots) = slots.lock() else {
        return;
    };
    let idle = slots.get(conversation_id).is_some_and(|slot| {
        Arc::strong_count(&slot.lock) == 1
            && Arc::strong_count(&slot.scratch) == 1
            && slot.scratch.is_empty()
    });
    if idle {
        slots.remove(conversation_id);
    }
}

/// History a branch from `turn` starts with
fn branch_history(turn: &TurnRecord) -> Result<Vec<Entry>, TurnError> {
    match turn.status() {
        TurnStatus::Completed | TurnStatus::Interrupted => {
            Ok(resolved_history(turn.entries.clone()))
        }
        status => Err(TurnError::conflict(format!(
            "turn '{}' is {status}; only completed or interrupted turns can be branched from",
            turn.id
        ))),
    }
}

/// Cut a snapshot before its first tool call that never got a result
fn resolved_history(mut entries: Vec<Entry>) -> Vec<Entry> {
    let answered: HashSet<&str> = entries
        .iter()
        .filter_map(|e| match e {
            Entry::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
        .collect();
    let open = entries
        .iter()
        .position(|e| matches!(e, Entry::ToolCall { id, .. } if !answered.contains(id.as_str())));
    if let Some(pos) = open {
        entries.truncate(pos);
    }
    entries
}

#[cfg(test)]
impl TurnOrchestrator {
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or_default()
    }
}
