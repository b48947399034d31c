//! Trait abstractions for runtime I/O
//!
//! These traits let the orchestrator run against the database, the scratch
//! store, or test doubles interchangeably.

use crate::access::Identity;
use crate::audit::AuditRecord;
use crate::cache::CachedAnswer;
use crate::db::{
    CheckpointSummary, Database, DbResult, Entry, ResumedCheckpoint, TurnRecord, TurnState,
    TurnStatus, Usage,
};
use crate::state_machine::ToolCall;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Storage
// ============================================================================

/// Conversation ownership records
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create the conversation if absent; returns whoever owns it afterwards
    async fn claim_conversation(&self, id: &str, owner_id: &str) -> DbResult<String>;

    async fn conversation_owner(&self, id: &str) -> DbResult<Option<String>>;

    /// Remove a conversation with its turns and checkpoints
    async fn delete_conversation(&self, id: &str) -> DbResult<()>;
}

/// Turn records
#[async_trait]
pub trait TurnStore: Send + Sync {
    async fn save_turn(&self, turn: &TurnRecord) -> DbResult<()>;

    async fn get_turn(&self, conversation_id: &str, turn_id: &str) -> DbResult<TurnRecord>;

    /// Most recent turn in the conversation with the given status
    async fn latest_turn(
        &self,
        conversation_id: &str,
        status: TurnStatus,
    ) -> DbResult<Option<TurnRecord>>;
}

/// Append-only snapshots of turn entries
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn append(
        &self,
        conversation_id: &str,
        turn_id: &str,
        state: &TurnState,
        entries: &[Entry],
        parent_checkpoint_id: Option<&str>,
    ) -> DbResult<String>;

    /// Summaries in creation order
    async fn list(&self, conversation_id: &str) -> DbResult<Vec<CheckpointSummary>>;

    /// Load a checkpoint; fails with not-found when it belongs elsewhere
    async fn resume_from(
        &self,
        conversation_id: &str,
        checkpoint_id: &str,
    ) -> DbResult<ResumedCheckpoint>;

    /// Fork a checkpoint with replacement entries; returns the new id
    async fn edit(
        &self,
        conversation_id: &str,
        checkpoint_id: &str,
        replacement: &[Entry],
    ) -> DbResult<String>;
}

/// Combined storage trait for convenience
pub trait Storage: ConversationStore + TurnStore + CheckpointStore {}
impl<T: ConversationStore + TurnStore + CheckpointStore> Storage for T {}

/// Resolves hashed bearer credentials to identities
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn identity_for_key(&self, key_hash: &str) -> DbResult<Option<Identity>>;
}

// ============================================================================
// Collaborators
// ============================================================================

/// Which collaborator failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Collaborator {
    Reasoner,
    ToolExecutor,
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collaborator::Reasoner => write!(f, "reasoner"),
            Collaborator::ToolExecutor => write!(f, "tool executor"),
        }
    }
}

/// Failure of an external collaborator call
#[derive(Debug, Clone, Error)]
#[error("{collaborator} failed: {message}")]
pub struct InvocationError {
    pub collaborator: Collaborator,
    pub message: String,
}

impl InvocationError {
    pub fn reasoner(message: impl Into<String>) -> Self {
        Self {
            collaborator: Collaborator::Reasoner,
            message: message.into(),
        }
    }

    pub fn tool(message: impl Into<String>) -> Self {
        Self {
            collaborator: Collaborator::ToolExecutor,
            message: message.into(),
        }
    }
}

/// Context handed to the reasoner
#[derive(Debug, Clone, Serialize)]
pub struct ReasonerRequest {
    pub conversation_id: String,
    pub turn_id: String,
    pub entries: Vec<Entry>,
}

/// Reasoner outcome: a final message or a request to call a tool
#[derive(Debug, Clone, PartialEq)]
pub enum ReasonerOutput {
    Final {
        text: String,
        usage: Usage,
        cacheable: bool,
    },
    ToolCall {
        call: ToolCall,
        usage: Usage,
    },
}

/// The reasoning model, treated as an opaque oracle
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Produce a reply for the context, sending text deltas as they arrive.
    ///
    /// A closed `deltas` channel means nobody is listening any more; the
    /// implementation should stop early.
    async fn invoke(
        &self,
        request: &ReasonerRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<ReasonerOutput, InvocationError>;
}

/// Executor for tools
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Run a tool by name with cancellation support
    async fn run(
        &self,
        name: &str,
        arguments: &Value,
        cancel: CancellationToken,
    ) -> Result<Value, InvocationError>;
}

/// Answer cache keyed by a context fingerprint, scoped per identity
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn lookup(&self, identity: &Identity, fingerprint: &str) -> Option<CachedAnswer>;

    async fn store(&self, identity: &Identity, fingerprint: &str, answer: CachedAnswer);
}

/// Destination for access and lifecycle decisions
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

// ============================================================================
// Production Adapters
// ============================================================================

/// Adapter to use Database as Storage
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[allow(dead_code)] // Useful for tests
    pub fn inner(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl ConversationStore for DatabaseStorage {
    async fn claim_conversation(&self, id: &str, owner_id: &str) -> DbResult<String> {
        self.db.claim_conversation(id, owner_id)
    }

    async fn conversation_owner(&self, id: &str) -> DbResult<Option<String>> {
        self.db.conversation_owner(id)
    }

    async fn delete_conversation(&self, id: &str) -> DbResult<()> {
        self.db.delete_conversation(id)
    }
}

#[async_trait]
impl TurnStore for DatabaseStorage {
    async fn save_turn(&self, turn: &TurnRecord) -> DbResult<()> {
        self.db.save_turn(turn)
    }

    async fn get_turn(&self, conversation_id: &str, turn_id: &str) -> DbResult<TurnRecord> {
        self.db.get_turn(conversation_id, turn_id)
    }

    async fn latest_turn(
        &self,
        conversation_id: &str,
        status: TurnStatus,
    ) -> DbResult<Option<TurnRecord>> {
        self.db.latest_turn(conversation_id, status)
    }
}

#[async_trait]
impl CheckpointStore for DatabaseStorage {
    async fn append(
        &self,
        conversation_id: &str,
        turn_id: &str,
        state: &TurnState,
        entries: &[Entry],
        parent_checkpoint_id: Option<&str>,
    ) -> DbResult<String> {
        self.db
            .append_checkpoint(conversation_id, turn_id, state, entries, parent_checkpoint_id)
    }

    async fn list(&self, conversation_id: &str) -> DbResult<Vec<CheckpointSummary>> {
        self.db.list_checkpoints(conversation_id)
    }

    async fn resume_from(
        &self,
        conversation_id: &str,
        checkpoint_id: &str,
    ) -> DbResult<ResumedCheckpoint> {
        self.db.resume_checkpoint(conversation_id, checkpoint_id)
    }

    async fn edit(
        &self,
        conversation_id: &str,
        checkpoint_id: &str,
        replacement: &[Entry],
    ) -> DbResult<String> {
        self.db
            .edit_checkpoint(conversation_id, checkpoint_id, replacement)
    }
}

#[async_trait]
impl CredentialStore for DatabaseStorage {
    async fn identity_for_key(&self, key_hash: &str) -> DbResult<Option<Identity>> {
        self.db.identity_for_key(key_hash)
    }
}
