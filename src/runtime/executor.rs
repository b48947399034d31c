//! Turn executor
//!
//! Feeds events through the pure transition function and carries out the
//! resulting effects until the turn settles in a terminal or interrupted
//! state.

use super::traits::{ReasonerOutput, ReasonerRequest, Storage};
use super::{Collaborators, Timeouts};
use crate::access::Identity;
use crate::audit::AuditRecord;
use crate::cache::{fingerprint, CachedAnswer};
use crate::db::{new_entry_id, DbResult, Entry, TurnRecord, TurnState};
use crate::state_machine::{transition, Effect, Event, FailureKind, ToolCall, TurnContext};
use crate::transport::TurnEvent;
use chrono::Utc;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Deltas buffered between the reasoner and the executor
const DELTA_BUFFER: usize = 64;

/// Everything a driver needs to run one turn
pub(crate) struct TurnSetup {
    pub context: TurnContext,
    pub record: TurnRecord,
    pub identity: Identity,
    pub store: Arc<dyn Storage>,
    pub collaborators: Collaborators,
    pub timeouts: Timeouts,
    pub cancel: CancellationToken,
    /// Checkpoint the turn's history was taken from, parent of its first checkpoint
    pub base_checkpoint_id: Option<String>,
    /// `None` when nobody is listening (e.g. closing a superseded turn)
    pub events: Option<mpsc::Sender<TurnEvent>>,
}

/// Runs a single turn
pub(crate) struct TurnDriver {
    context: TurnContext,
    record: TurnRecord,
    identity: Identity,
    store: Arc<dyn Storage>,
    collaborators: Collaborators,
    timeouts: Timeouts,
    cancel: CancellationToken,
    base_checkpoint_id: Option<String>,
    events: Option<mpsc::Sender<TurnEvent>>,
    /// Fingerprint of the context the cache was probed with
    probe_fingerprint: Option<String>,
}

impl TurnDriver {
    pub fn new(setup: TurnSetup) -> Self {
        Self {
            context: setup.context,
            record: setup.record,
            identity: setup.identity,
            store: setup.store,
            collaborators: setup.collaborators,
            timeouts: setup.timeouts,
            cancel: setup.cancel,
            base_checkpoint_id: setup.base_checkpoint_id,
            events: setup.events,
            probe_fingerprint: None,
        }
    }

    /// Process `first` and every event it leads to; returns the settled turn
    pub async fn run(mut self, first: Event) -> TurnRecord {
        tracing::info!(
            conv_id = %self.context.conversation_id,
            turn_id = %self.context.turn_id,
            event = first.name(),
            "Driving turn"
        );

        let mut pending = VecDeque::from([first]);
        while let Some(event) = pending.pop_front() {
            let name = event.name();
            let result = match transition(&self.record.state, &self.context, event) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(
                        turn_id = %self.context.turn_id,
                        event = name,
                        error = %e,
                        "Transition rejected"
                    );
                    if !self.record.state.is_terminal() {
                        pending.push_back(Event::Aborted {
                            kind: FailureKind::Internal,
                            message: e.to_string(),
                        });
                    }
                    continue;
                }
            };

            tracing::debug!(
                turn_id = %self.context.turn_id,
                event = name,
                status = %result.new_state.status(),
                "Transition"
            );
            self.record.state = result.new_state;

            for effect in result.effects {
                match self.execute_effect(effect).await {
                    Ok(Some(generated)) => pending.push_back(generated),
                    Ok(None) => {}
                    Err(e) if matches!(self.record.state, TurnState::Failed { .. }) => {
                        // Already failing; keep going so the caller still hears about it
                        tracing::error!(turn_id = %self.context.turn_id, error = %e, "Failed to persist failed turn");
                    }
                    Err(e) => {
                        tracing::error!(turn_id = %self.context.turn_id, error = %e, "Failed to persist turn");
                        pending.push_back(Event::PersistenceFailed {
                            message: e.to_string(),
                        });
                        break;
                    }
                }
            }
        }

        tracing::info!(
            conv_id = %self.context.conversation_id,
            turn_id = %self.context.turn_id,
            status = %self.record.status(),
            tokens = self.record.usage.total_tokens(),
            "Turn settled"
        );
        self.record
    }

    /// Execute an effect and optionally return a generated event.
    ///
    /// Only persistence errors are returned; collaborator failures become
    /// events.
    async fn execute_effect(&mut self, effect: Effect) -> DbResult<Option<Event>> {
        match effect {
            Effect::ProbeCache => {
                let fp = fingerprint(&self.record.entries);
                let hit = self
                    .collaborators
                    .cache
                    .lookup(&self.identity, &fp)
                    .await;
                self.probe_fingerprint = Some(fp);
                Ok(Some(match hit {
                    Some(answer) => {
                        tracing::info!(turn_id = %self.context.turn_id, "Cache hit");
                        Event::CacheHit { answer }
                    }
                    None => Event::CacheMiss,
                }))
            }

            Effect::InvokeReasoner => Ok(Some(self.invoke_reasoner().await)),

            Effect::ExecuteTool { call } => Ok(Some(self.execute_tool(call).await)),

            Effect::SkipTool {
                tool_call_id,
                payload,
                is_error,
            } => Ok(Some(Event::ToolFinished {
                tool_call_id,
                payload,
                is_error,
            })),

            Effect::AppendMessage { role, text } => {
                self.record.entries.push(Entry::message(role, text));
                Ok(None)
            }

            Effect::AppendToolCall { call } => {
                self.record.entries.push(Entry::ToolCall {
                    id: call.id,
                    name: call.name,
                    arguments: call.arguments,
                });
                Ok(None)
            }

            Effect::AppendToolResult {
                tool_call_id,
                payload,
                is_error,
            } => {
                self.record.entries.push(Entry::ToolResult {
                    id: new_entry_id(),
                    tool_call_id,
                    payload,
                    is_error,
                });
                Ok(None)
            }

            Effect::RecordUsage { usage } => {
                self.record.usage.add(usage);
                Ok(None)
            }

            Effect::Checkpoint => {
                self.checkpoint().await?;
                Ok(None)
            }

            Effect::StoreCache { text } => {
                if let Some(fp) = &self.probe_fingerprint {
                    self.collaborators
                        .cache
                        .store(&self.identity, fp, CachedAnswer { text })
                        .await;
                }
                Ok(None)
            }

            Effect::Emit { event } => {
                self.emit(event).await;
                Ok(None)
            }

            Effect::EmitCompleted => {
                self.emit(TurnEvent::Completed {
                    usage: self.record.usage,
                })
                .await;
                Ok(None)
            }

            Effect::Audit { action, outcome } => {
                self.collaborators.audit.record(AuditRecord::new(
                    &self.identity.user_id,
                    action,
                    format!("{}/{}", self.context.conversation_id, self.context.turn_id),
                    outcome,
                ));
                Ok(None)
            }
        }
    }

    async fn checkpoint(&mut self) -> DbResult<()> {
        let parent = self
            .record
            .last_checkpoint_id
            .clone()
            .or_else(|| self.base_checkpoint_id.clone());
        let id = self
            .store
            .append(
                &self.context.conversation_id,
                &self.context.turn_id,
                &self.record.state,
                &self.record.entries,
                parent.as_deref(),
            )
            .await?;
        self.record.last_checkpoint_id = Some(id);
        self.record.updated_at = Utc::now();
        self.store.save_turn(&self.record).await
    }

    async fn emit(&mut self, event: TurnEvent) {
        let Some(events) = &self.events else {
            return;
        };
        if events.send(event).await.is_err() {
            self.drop_listener();
        }
    }

    fn drop_listener(&mut self) {
        tracing::info!(turn_id = %self.context.turn_id, "Client went away, cancelling turn");
        self.events = None;
        self.cancel.cancel();
    }

    /// Resolves once the listener drops its receiver; pending without a listener
    fn listener_closed(&self) -> impl Future<Output = ()> + 'static {
        let events = self.events.clone();
        async move {
            match events {
                Some(events) => events.closed().await,
                None => std::future::pending().await,
            }
        }
    }

    fn cancelled(&self) -> Event {
        Event::Aborted {
            kind: FailureKind::Cancelled,
            message: "turn was cancelled".to_string(),
        }
    }

    async fn invoke_reasoner(&mut self) -> Event {
        if self.cancel.is_cancelled() {
            return self.cancelled();
        }

        let request = ReasonerRequest {
            conversation_id: self.context.conversation_id.clone(),
            turn_id: self.context.turn_id.clone(),
            entries: self.record.entries.clone(),
        };
        let reasoner = Arc::clone(&self.collaborators.reasoner);
        let limit = self.timeouts.reasoner;
        let (delta_tx, mut delta_rx) = mpsc::channel(DELTA_BUFFER);
        let call = async move { tokio::time::timeout(limit, reasoner.invoke(&request, delta_tx)).await };
        tokio::pin!(call);

        let cancel = self.cancel.clone();
        let closed = self.listener_closed();
        tokio::pin!(closed);
        let outcome = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return self.cancelled(),
                () = &mut closed => {
                    self.drop_listener();
                    return self.cancelled();
                }
                Some(delta) = delta_rx.recv() => {
                    self.emit(TurnEvent::OutputTextDelta { delta }).await;
                }
                outcome = &mut call => break outcome,
            }
        };
        while let Ok(delta) = delta_rx.try_recv() {
            self.emit(TurnEvent::OutputTextDelta { delta }).await;
        }

        match outcome {
            Err(_) => Event::InvocationFailed {
                message: format!("reasoner timed out after {}ms", limit.as_millis()),
            },
            Ok(Err(e)) => Event::InvocationFailed {
                message: e.to_string(),
            },
            Ok(Ok(ReasonerOutput::Final {
                text,
                usage,
                cacheable,
            })) => Event::ReasonerReplied {
                text,
                usage,
                cacheable,
            },
            Ok(Ok(ReasonerOutput::ToolCall { call, usage })) => {
                Event::ToolCallRequested { call, usage }
            }
        }
    }

    async fn execute_tool(&mut self, call: ToolCall) -> Event {
        if self.cancel.is_cancelled() {
            return self.cancelled();
        }

        let tools = Arc::clone(&self.collaborators.tools);
        let limit = self.timeouts.tool;
        let cancel = self.cancel.clone();
        let run = tools.run(&call.name, &call.arguments, cancel.child_token());
        let closed = self.listener_closed();

        tokio::select! {
            biased;
            () = cancel.cancelled() => self.cancelled(),
            () = closed => {
                self.drop_listener();
                self.cancelled()
            }
            result = tokio::time::timeout(limit, run) => match result {
                Err(_) => Event::InvocationFailed {
                    message: format!("tool '{}' timed out after {}ms", call.name, limit.as_millis()),
                },
                Ok(Err(e)) => Event::InvocationFailed { message: e.to_string() },
                Ok(Ok(payload)) => Event::ToolFinished {
                    tool_call_id: call.id.clone(),
                    payload,
                    is_error: false,
                },
            },
        }
    }
}
