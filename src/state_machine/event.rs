//! Events that drive a turn

use crate::cache::CachedAnswer;
use crate::db::Usage;
use crate::state_machine::state::{FailureKind, ToolCall, ToolDecision};
use serde_json::Value;

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum Event {
    /// A freshly created turn begins processing
    Start,

    // Cache events
    CacheHit {
        answer: CachedAnswer,
    },
    CacheMiss,

    // Reasoner events
    ReasonerReplied {
        text: String,
        usage: Usage,
        /// The reasoner may mark a reply as unsuitable for reuse
        cacheable: bool,
    },
    ToolCallRequested {
        call: ToolCall,
        usage: Usage,
    },

    // Caller events
    Decision {
        decision: ToolDecision,
    },

    // Tool events
    ToolFinished {
        tool_call_id: String,
        payload: Value,
        is_error: bool,
    },

    // Failures
    InvocationFailed {
        message: String,
    },
    Aborted {
        kind: FailureKind,
        message: String,
    },
    PersistenceFailed {
        message: String,
    },
}

impl Event {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Event::Start => "start",
            Event::CacheHit { .. } => "cache_hit",
            Event::CacheMiss => "cache_miss",
            Event::ReasonerReplied { .. } => "reasoner_replied",
            Event::ToolCallRequested { .. } => "tool_call_requested",
            Event::Decision { .. } => "decision",
            Event::ToolFinished { .. } => "tool_finished",
            Event::InvocationFailed { .. } => "invocation_failed",
            Event::Aborted { .. } => "aborted",
            Event::PersistenceFailed { .. } => "persistence_failed",
        }
    }
}
