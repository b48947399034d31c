//! Turn state types

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

// ============================================================================
// Tool calls and decisions
// ============================================================================

/// A tool call requested by the reasoner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// The kinds of decision a caller may submit against an interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Accept,
    Reject,
    Edit,
    Feedback,
}

impl DecisionKind {
    pub const ALL: [DecisionKind; 4] = [
        DecisionKind::Accept,
        DecisionKind::Reject,
        DecisionKind::Edit,
        DecisionKind::Feedback,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DecisionKind::Accept => "accept",
            DecisionKind::Reject => "reject",
            DecisionKind::Edit => "edit",
            DecisionKind::Feedback => "feedback",
        }
    }
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A caller's resolution of a pending tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Reject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Edit {
        #[serde(alias = "args")]
        arguments: Value,
    },
    Feedback {
        message: String,
    },
}

impl Decision {
    pub fn kind(&self) -> DecisionKind {
        match self {
            Decision::Accept => DecisionKind::Accept,
            Decision::Reject { .. } => DecisionKind::Reject,
            Decision::Edit { .. } => DecisionKind::Edit,
            Decision::Feedback { .. } => DecisionKind::Feedback,
        }
    }

    /// Shape checks that do not depend on the pending interrupt
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Decision::Edit { arguments } => match arguments {
                Value::Null => Err("edit decision requires arguments".to_string()),
                Value::Object(_) => Ok(()),
                _ => Err("edit arguments must be a JSON object".to_string()),
            },
            Decision::Feedback { message } if message.trim().is_empty() => {
                Err("feedback decision requires a non-empty message".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// A decision addressed to a specific pending tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDecision {
    pub tool_call_id: String,
    #[serde(flatten)]
    pub decision: Decision,
}

/// Why a decision could not be applied to the pending interrupt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionMismatch {
    WrongToolCall { expected: String, got: String },
    NotAllowed(DecisionKind),
}

impl fmt::Display for DecisionMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionMismatch::WrongToolCall { expected, got } => write!(
                f,
                "decision targets tool call '{got}' but the pending call is '{expected}'"
            ),
            DecisionMismatch::NotAllowed(kind) => {
                write!(f, "decision '{kind}' is not allowed for the pending call")
            }
        }
    }
}

/// Pending interrupt on a paused turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub tool_call_id: String,
    /// The requested action; its arguments are what an `edit` replaces
    pub action: ToolCall,
    pub allowed_decisions: Vec<DecisionKind>,
}

impl Interrupt {
    pub fn for_call(call: ToolCall) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            action: call,
            allowed_decisions: DecisionKind::ALL.to_vec(),
        }
    }

    pub fn check(&self, decision: &ToolDecision) -> Result<(), DecisionMismatch> {
        if decision.tool_call_id != self.tool_call_id {
            return Err(DecisionMismatch::WrongToolCall {
                expected: self.tool_call_id.clone(),
                got: decision.tool_call_id.clone(),
            });
        }
        let kind = decision.decision.kind();
        if !self.allowed_decisions.contains(&kind) {
            return Err(DecisionMismatch::NotAllowed(kind));
        }
        Ok(())
    }
}

// ============================================================================
// Failures
// ============================================================================

/// Classification of a turn failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Reasoner or tool executor failed or timed out
    Invocation,
    Cancelled,
    /// Replaced by a newer turn while waiting on a decision
    Superseded,
    Internal,
}

/// Error detail recorded on a failed turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: FailureKind,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

// ============================================================================
// Turn state
// ============================================================================

/// Externally visible lifecycle status of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Created,
    Streaming,
    Interrupted,
    Completed,
    Failed,
}

impl TurnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnStatus::Created => "created",
            TurnStatus::Streaming => "streaming",
            TurnStatus::Interrupted => "interrupted",
            TurnStatus::Completed => "completed",
            TurnStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(TurnStatus::Created),
            "streaming" => Some(TurnStatus::Streaming),
            "interrupted" => Some(TurnStatus::Interrupted),
            "completed" => Some(TurnStatus::Completed),
            "failed" => Some(TurnStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TurnStatus::Completed | TurnStatus::Failed)
    }
}

impl fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal turn state, persisted as JSON alongside the turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnState {
    #[default]
    Created,

    /// Looking up a cached answer for the current context
    Probing,

    /// Waiting on the reasoner. `cacheable` goes false once the turn has
    /// seen a tool result, so such replies never enter the cache.
    Reasoning { cacheable: bool },

    /// Paused on a tool call until a caller decision arrives
    Interrupted { interrupt: Interrupt },

    /// Applying a decision: running the (possibly edited) call or
    /// recording a synthetic result for it
    Resuming { call: ToolCall, decision: DecisionKind },

    Completed,

    Failed { error: ErrorDetail },
}

impl TurnState {
    pub fn status(&self) -> TurnStatus {
        match self {
            TurnState::Created => TurnStatus::Created,
            TurnState::Probing | TurnState::Reasoning { .. } | TurnState::Resuming { .. } => {
                TurnStatus::Streaming
            }
            TurnState::Interrupted { .. } => TurnStatus::Interrupted,
            TurnState::Completed => TurnStatus::Completed,
            TurnState::Failed { .. } => TurnStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn interrupt(&self) -> Option<&Interrupt> {
        match self {
            TurnState::Interrupted { interrupt } => Some(interrupt),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorDetail> {
        match self {
            TurnState::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Immutable per-turn configuration handed to every transition
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub conversation_id: String,
    pub turn_id: String,
    pub previous_turn_id: Option<String>,
    pub cache_enabled: bool,
}

impl TurnContext {
    pub fn new(conversation_id: impl Into<String>, turn_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            turn_id: turn_id.into(),
            previous_turn_id: None,
            cache_enabled: true,
        }
    }
}

/// Payload recorded for a tool call the caller rejected
pub fn rejected_payload(message: Option<&str>) -> Value {
    json!({
        "status": "rejected",
        "message": message.unwrap_or("The user rejected this tool call."),
    })
}

/// Payload recorded for a tool call answered with feedback instead of running
pub fn feedback_payload(message: &str) -> Value {
    json!({
        "status": "not_executed",
        "feedback": message,
    })
}
