//! Pure state transition function
//!
//! Given the current turn state, the turn context and an event, computes the
//! next state and the effects the executor must run. No I/O happens here.

use super::state::{
    feedback_payload, rejected_payload, Decision, DecisionMismatch, ErrorDetail, FailureKind,
    Interrupt, TurnContext, TurnState, TurnStatus,
};
use super::{Effect, Event};
use crate::transport::TurnEvent;
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: TurnState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: TurnState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("Turn is already {0}")]
    TurnClosed(TurnStatus),
    #[error("Turn has no pending tool call")]
    NoPendingInterrupt,
    #[error("{0}")]
    DecisionRejected(DecisionMismatch),
    #[error("Invalid decision: {0}")]
    InvalidDecision(String),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Pure transition function
pub fn transition(
    state: &TurnState,
    context: &TurnContext,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    match (state, event) {
        // ============================================================
        // Persistence failures may land after a terminal state was
        // computed but before it was durably written
        // ============================================================
        (TurnState::Failed { .. }, Event::PersistenceFailed { .. }) => {
            Err(TransitionError::TurnClosed(TurnStatus::Failed))
        }
        (_, Event::PersistenceFailed { message }) => Ok(fail(ErrorDetail::new(
            FailureKind::Internal,
            format!("failed to persist turn: {message}"),
        ))),

        // Terminal states accept nothing else
        (TurnState::Completed | TurnState::Failed { .. }, _) => {
            Err(TransitionError::TurnClosed(state.status()))
        }

        // ============================================================
        // Start
        // ============================================================
        (TurnState::Created, Event::Start) => {
            let created = Effect::emit(TurnEvent::Created {
                previous_turn_id: context.previous_turn_id.clone(),
            });
            if context.cache_enabled {
                Ok(TransitionResult::new(TurnState::Probing)
                    .with_effect(created)
                    .with_effect(Effect::audit("turn.create", "created"))
                    .with_effect(Effect::Checkpoint)
                    .with_effect(Effect::ProbeCache))
            } else {
                Ok(TransitionResult::new(TurnState::Reasoning { cacheable: true })
                    .with_effect(created)
                    .with_effect(Effect::audit("turn.create", "created"))
                    .with_effect(Effect::Checkpoint)
                    .with_effect(Effect::InvokeReasoner))
            }
        }

        // ============================================================
        // Cache probing
        // ============================================================
        (TurnState::Probing, Event::CacheHit { answer }) => {
            Ok(TransitionResult::new(TurnState::Completed).with_effects([
                Effect::assistant_message(answer.text.clone()),
                Effect::emit(TurnEvent::Message { text: answer.text }),
                Effect::Checkpoint,
                Effect::EmitCompleted,
                Effect::audit("turn.complete", "cache_hit"),
            ]))
        }

        (TurnState::Probing, Event::CacheMiss) => {
            Ok(TransitionResult::new(TurnState::Reasoning { cacheable: true })
                .with_effect(Effect::Checkpoint)
                .with_effect(Effect::InvokeReasoner))
        }

        // ============================================================
        // Reasoner replies
        // ============================================================
        (
            TurnState::Reasoning { cacheable },
            Event::ReasonerReplied {
                text,
                usage,
                cacheable: reply_cacheable,
            },
        ) => {
            let mut result = TransitionResult::new(TurnState::Completed).with_effects([
                Effect::RecordUsage { usage },
                Effect::assistant_message(text.clone()),
                Effect::emit(TurnEvent::Message { text: text.clone() }),
                Effect::Checkpoint,
            ]);
            if context.cache_enabled && *cacheable && reply_cacheable {
                result = result.with_effect(Effect::StoreCache { text });
            }
            Ok(result
                .with_effect(Effect::EmitCompleted)
                .with_effect(Effect::audit("turn.complete", "completed")))
        }

        (TurnState::Reasoning { .. }, Event::ToolCallRequested { call, usage }) => {
            let interrupt = Interrupt::for_call(call.clone());
            Ok(TransitionResult::new(TurnState::Interrupted {
                interrupt: interrupt.clone(),
            })
            .with_effects([
                Effect::RecordUsage { usage },
                Effect::AppendToolCall { call },
                Effect::Checkpoint,
                Effect::emit(TurnEvent::Interrupted { interrupt }),
                Effect::audit("turn.interrupt", "interrupted"),
            ]))
        }

        // ============================================================
        // Decisions
        // ============================================================
        (TurnState::Interrupted { interrupt }, Event::Decision { decision }) => {
            interrupt
                .check(&decision)
                .map_err(TransitionError::DecisionRejected)?;
            decision
                .decision
                .validate()
                .map_err(TransitionError::InvalidDecision)?;

            let kind = decision.decision.kind();
            let mut call = interrupt.action.clone();
            let apply = match decision.decision {
                Decision::Accept => Effect::ExecuteTool { call: call.clone() },
                Decision::Edit { arguments } => {
                    call.arguments = arguments;
                    Effect::ExecuteTool { call: call.clone() }
                }
                Decision::Reject { message } => Effect::SkipTool {
                    tool_call_id: call.id.clone(),
                    payload: rejected_payload(message.as_deref()),
                    is_error: true,
                },
                Decision::Feedback { message } => Effect::SkipTool {
                    tool_call_id: call.id.clone(),
                    payload: feedback_payload(&message),
                    is_error: false,
                },
            };

            Ok(TransitionResult::new(TurnState::Resuming {
                call: call.clone(),
                decision: kind,
            })
            .with_effects([
                Effect::emit(TurnEvent::Resumed {
                    tool_call_id: call.id,
                    decision: kind,
                }),
                Effect::audit("turn.resume", kind.as_str()),
                Effect::Checkpoint,
                apply,
            ]))
        }

        (_, Event::Decision { .. }) => Err(TransitionError::NoPendingInterrupt),

        // ============================================================
        // Tool results
        // ============================================================
        (
            TurnState::Resuming { call, .. },
            Event::ToolFinished {
                tool_call_id,
                payload,
                is_error,
            },
        ) => {
            if tool_call_id != call.id {
                return Err(TransitionError::InvalidTransition(format!(
                    "tool result for '{tool_call_id}' while resuming '{}'",
                    call.id
                )));
            }
            Ok(
                TransitionResult::new(TurnState::Reasoning { cacheable: false }).with_effects([
                    Effect::AppendToolResult {
                        tool_call_id,
                        payload,
                        is_error,
                    },
                    Effect::Checkpoint,
                    Effect::InvokeReasoner,
                ]),
            )
        }

        // ============================================================
        // Failures
        // ============================================================
        (
            TurnState::Probing | TurnState::Reasoning { .. } | TurnState::Resuming { .. },
            Event::InvocationFailed { message },
        ) => Ok(fail(ErrorDetail::new(FailureKind::Invocation, message))),

        (_, Event::Aborted { kind, message }) => Ok(fail(ErrorDetail::new(kind, message))),

        // ============================================================
        // Everything else is invalid
        // ============================================================
        (state, event) => Err(TransitionError::InvalidTransition(format!(
            "{} in state {:?}",
            event.name(),
            state.status()
        ))),
    }
}

fn fail(error: ErrorDetail) -> TransitionResult {
    TransitionResult::new(TurnState::Failed {
        error: error.clone(),
    })
    .with_effects([
        Effect::Checkpoint,
        Effect::emit_failed(&error),
        Effect::audit("turn.fail", format!("{:?}", error.kind).to_lowercase()),
    ])
}
