//! API request and response types

use crate::db::{
    CheckpointSummary, ContentBlock, Entry, ResumedCheckpoint, Role, TurnRecord, TurnState,
    TurnStatus, Usage,
};
use crate::error::TurnError;
use crate::runtime::{InputEntry, TurnOptions, TurnRequest};
use crate::state_machine::{ErrorDetail, Interrupt, ToolDecision};
use crate::transport::StreamMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_true() -> bool {
    true
}

/// Body of `POST /v1/turns`
#[derive(Debug, Deserialize)]
pub struct CreateTurnRequest {
    pub input: Vec<InputItem>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub previous_response_id: Option<String>,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    #[serde(default)]
    pub stream: StreamMode,
    #[serde(default = "default_true")]
    pub store: bool,
    #[serde(default = "default_true")]
    pub cache: bool,
    #[serde(default)]
    pub reasoner_timeout_ms: Option<u64>,
    #[serde(default)]
    pub tool_timeout_ms: Option<u64>,
}

impl CreateTurnRequest {
    /// Split into the conversation reference and a validated turn request
    pub fn into_turn(self) -> Result<(Option<String>, TurnRequest), TurnError> {
        let options = TurnOptions {
            previous_turn_id: self.previous_response_id,
            checkpoint_id: self.checkpoint_id,
            store: self.store,
            cache: self.cache,
            reasoner_timeout: self.reasoner_timeout_ms.map(Duration::from_millis),
            tool_timeout: self.tool_timeout_ms.map(Duration::from_millis),
        };
        let input = self.input.into_iter().map(InputEntry::from).collect();
        Ok((self.conversation_id, TurnRequest::parse(input, options)?))
    }
}

/// One item of `input`
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
    Message {
        role: Role,
        content: MessageContent,
    },
    ToolDecision(ToolDecision),
}

/// Message content: a plain string or a list of blocks
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl From<InputItem> for InputEntry {
    fn from(item: InputItem) -> Self {
        match item {
            InputItem::Message { role, content } => {
                let content = match content {
                    MessageContent::Text(text) if text.is_empty() => Vec::new(),
                    MessageContent::Text(text) => vec![ContentBlock::text(text)],
                    MessageContent::Blocks(blocks) => blocks,
                };
                InputEntry::Message { role, content }
            }
            InputItem::ToolDecision(decision) => InputEntry::Decision(decision),
        }
    }
}

/// A turn as returned to clients
#[derive(Debug, Serialize)]
pub struct TurnEnvelope {
    pub id: String,
    pub object: &'static str,
    pub conversation_id: String,
    pub previous_turn_id: Option<String>,
    pub status: TurnStatus,
    /// Entries appended by this turn, its own input included
    pub output: Vec<Entry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<Interrupt>,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub checkpoint_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&TurnRecord> for TurnEnvelope {
    fn from(turn: &TurnRecord) -> Self {
        Self {
            id: turn.id.clone(),
            object: "turn",
            conversation_id: turn.conversation_id.clone(),
            previous_turn_id: turn.previous_turn_id.clone(),
            status: turn.status(),
            output: turn.output().to_vec(),
            interrupt: turn.state.interrupt().cloned(),
            usage: turn.usage,
            error: turn.state.error().cloned(),
            checkpoint_id: turn.last_checkpoint_id.clone(),
            created_at: turn.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CheckpointListResponse {
    pub object: &'static str,
    pub data: Vec<CheckpointSummary>,
}

/// A checkpoint loaded for resumption
#[derive(Debug, Serialize)]
pub struct CheckpointResponse {
    #[serde(flatten)]
    pub summary: CheckpointSummary,
    pub entries: Vec<Entry>,
    pub state: TurnState,
}

impl From<ResumedCheckpoint> for CheckpointResponse {
    fn from(checkpoint: ResumedCheckpoint) -> Self {
        Self {
            summary: checkpoint.summary,
            entries: checkpoint.entries,
            state: checkpoint.state,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EditCheckpointRequest {
    pub entries: Vec<Entry>,
}

#[derive(Debug, Serialize)]
pub struct EditCheckpointResponse {
    pub checkpoint_id: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub id: String,
    pub deleted: bool,
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                kind,
                message: message.into(),
            },
        }
    }
}
