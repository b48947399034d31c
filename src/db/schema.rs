//! Database schema and types

pub use crate::state_machine::state::{TurnState, TurnStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS api_keys (
    key_hash TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    roles TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_owner ON conversations(owner_id);

CREATE TABLE IF NOT EXISTS turns (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    previous_turn_id TEXT,
    status TEXT NOT NULL,
    state TEXT NOT NULL,
    entries TEXT NOT NULL,
    base_len INTEGER NOT NULL,
    usage TEXT NOT NULL,
    last_checkpoint_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_turns_conversation ON turns(conversation_id, seq);

CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    turn_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    parent_id TEXT,
    status TEXT NOT NULL,
    state TEXT NOT NULL,
    entries TEXT NOT NULL,
    created_at TEXT NOT NULL,

    UNIQUE (conversation_id, seq),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_conversation ON checkpoints(conversation_id, seq);
";

// ============================================================
// Entries
// ============================================================

/// Author of a message entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A block of message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Data { data: Value },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

/// Atomic unit of turn content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Entry {
    Message {
        id: String,
        role: Role,
        content: Vec<ContentBlock>,
    },
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
    },
    ToolResult {
        id: String,
        tool_call_id: String,
        payload: Value,
        #[serde(default)]
        is_error: bool,
    },
}

impl Entry {
    pub fn message(role: Role, text: impl Into<String>) -> Self {
        Entry::Message {
            id: new_entry_id(),
            role,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Entry::Message { id, .. } | Entry::ToolCall { id, .. } | Entry::ToolResult { id, .. } => {
                id
            }
        }
    }

    /// Concatenated text blocks of a message entry
    pub fn text(&self) -> Option<String> {
        match self {
            Entry::Message { content, .. } => Some(
                content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        ContentBlock::Data { .. } => None,
                    })
                    .collect::<Vec<_>>()
                    .join(""),
            ),
            _ => None,
        }
    }
}

pub fn new_entry_id() -> String {
    format!("ent_{}", uuid::Uuid::new_v4().simple())
}

/// Check that entry ids are unique and every tool result follows its call
pub fn validate_entries(entries: &[Entry]) -> Result<(), String> {
    let mut seen = HashSet::new();
    let mut calls = HashSet::new();
    for entry in entries {
        if entry.id().is_empty() {
            return Err("entry id must not be empty".to_string());
        }
        if !seen.insert(entry.id()) {
            return Err(format!("duplicate entry id '{}'", entry.id()));
        }
        match entry {
            Entry::ToolCall { id, .. } => {
                calls.insert(id.as_str());
            }
            Entry::ToolResult { tool_call_id, .. } if !calls.contains(tool_call_id.as_str()) => {
                return Err(format!(
                    "tool result references '{tool_call_id}' which does not precede it"
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

// ============================================================
// Usage
// ============================================================

/// Token usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_field_names)] // tokens suffix is meaningful
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

// ============================================================
// Records
// ============================================================

/// A turn as persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: String,
    pub conversation_id: String,
    pub previous_turn_id: Option<String>,
    pub state: TurnState,
    /// Full snapshot: inherited history followed by this turn's entries
    pub entries: Vec<Entry>,
    /// Number of inherited entries at the front of `entries`
    pub base_len: usize,
    pub usage: Usage,
    /// False for turns that live only in a per-conversation scratch store
    #[serde(default = "default_true")]
    pub store: bool,
    pub last_checkpoint_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl TurnRecord {
    pub fn status(&self) -> TurnStatus {
        self.state.status()
    }

    /// Entries appended by this turn
    pub fn output(&self) -> &[Entry] {
        self.entries.get(self.base_len..).unwrap_or_default()
    }
}

/// Checkpoint listing entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub id: String,
    pub conversation_id: String,
    pub turn_id: String,
    pub seq: i64,
    pub parent_id: Option<String>,
    pub status: TurnStatus,
    pub entry_count: usize,
    pub created_at: DateTime<Utc>,
}

/// A checkpoint loaded for resumption
#[derive(Debug, Clone)]
pub struct ResumedCheckpoint {
    pub summary: CheckpointSummary,
    pub entries: Vec<Entry>,
    /// Turn state captured with the snapshot
    pub state: TurnState,
}
