//! Effects produced by state transitions

use crate::db::{Role, Usage};
use crate::state_machine::state::{ErrorDetail, ToolCall};
use crate::transport::TurnEvent;
use serde_json::Value;

/// Effects to be executed after a state transition, in order
#[derive(Debug, Clone)]
pub enum Effect {
    /// Look up a cached answer for the turn's starting context
    ProbeCache,

    /// Invoke the reasoner on the current entries
    InvokeReasoner,

    /// Run a tool through the tool executor
    ExecuteTool { call: ToolCall },

    /// Record a result for a tool call without running it
    SkipTool {
        tool_call_id: String,
        payload: Value,
        is_error: bool,
    },

    /// Append a text message to the turn's entries
    AppendMessage { role: Role, text: String },

    /// Append the reasoner's tool call to the turn's entries
    AppendToolCall { call: ToolCall },

    /// Append a tool result to the turn's entries
    AppendToolResult {
        tool_call_id: String,
        payload: Value,
        is_error: bool,
    },

    /// Add reasoner usage to the turn's running total
    RecordUsage { usage: Usage },

    /// Write a checkpoint of the current entries and persist the turn
    Checkpoint,

    /// Remember an answer for the turn's starting context
    StoreCache { text: String },

    /// Send an event to the caller
    Emit { event: TurnEvent },

    /// Send `turn.completed` carrying the turn's final usage
    EmitCompleted,

    /// Record a lifecycle decision in the audit log
    Audit { action: &'static str, outcome: String },
}

impl Effect {
    pub fn assistant_message(text: impl Into<String>) -> Self {
        Effect::AppendMessage {
            role: Role::Assistant,
            text: text.into(),
        }
    }

    pub fn emit(event: TurnEvent) -> Self {
        Effect::Emit { event }
    }

    pub fn emit_failed(error: &ErrorDetail) -> Self {
        Effect::Emit {
            event: TurnEvent::Failed {
                error: error.clone(),
            },
        }
    }

    pub fn audit(action: &'static str, outcome: impl Into<String>) -> Self {
        Effect::Audit {
            action,
            outcome: outcome.into(),
        }
    }
}
