//! Database module for agentgate
//!
//! Provides persistence for credentials, conversation ownership, turns and
//! checkpoints.

mod schema;

pub use schema::*;

use crate::access::Identity;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Turn not found: {0}")]
    TurnNotFound(String),
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),
    #[error("Database connection lock poisoned")]
    LockPoisoned,
}

pub type DbResult<T> = Result<T, DbError>;

const TURN_COLUMNS: &str = "id, conversation_id, previous_turn_id, state, entries, base_len, usage,
     last_checkpoint_id, created_at, updated_at";

const CHECKPOINT_COLUMNS: &str =
    "id, conversation_id, turn_id, seq, parent_id, status, entries, created_at, state";

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Credential Operations ====================

    /// Register (or re-bind) an API key digest to a user
    pub fn upsert_api_key(&self, key_hash: &str, user_id: &str, roles: &[String]) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO api_keys (key_hash, user_id, roles, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key_hash) DO UPDATE SET user_id = excluded.user_id, roles = excluded.roles",
            params![
                key_hash,
                user_id,
                serde_json::to_string(roles)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Look up the identity bound to an API key digest
    pub fn identity_for_key(&self, key_hash: &str) -> DbResult<Option<Identity>> {
        let conn = self.conn()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT user_id, roles FROM api_keys WHERE key_hash = ?1",
                params![key_hash],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((user_id, roles)) => Ok(Some(Identity {
                user_id,
                roles: serde_json::from_str(&roles)?,
            })),
            None => Ok(None),
        }
    }

    // ==================== Conversation Operations ====================

    /// Create the conversation if absent and return its owner.
    ///
    /// Insert and read happen under one connection lock, so two callers
    /// racing on the same id observe the same owner.
    pub fn claim_conversation(&self, id: &str, owner_id: &str) -> DbResult<String> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT OR IGNORE INTO conversations (id, owner_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![id, owner_id, now],
        )?;
        let owner = conn.query_row(
            "SELECT owner_id FROM conversations WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(owner)
    }

    /// Owner of a conversation, if it exists
    pub fn conversation_owner(&self, id: &str) -> DbResult<Option<String>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT owner_id FROM conversations WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(DbError::from)
    }

    /// Delete a conversation with its turns and checkpoints
    pub fn delete_conversation(&self, id: &str) -> DbResult<()> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(DbError::ConversationNotFound(id.to_string()));
        }
        Ok(())
    }

    // ==================== Turn Operations ====================

    /// Insert or update a turn
    pub fn save_turn(&self, turn: &TurnRecord) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO turns (id, conversation_id, seq, previous_turn_id, status, state, entries,
                                base_len, usage, last_checkpoint_id, created_at, updated_at)
             VALUES (?1, ?2,
                     (SELECT COALESCE(MAX(seq), 0) + 1 FROM turns WHERE conversation_id = ?2),
                     ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                state = excluded.state,
                entries = excluded.entries,
                usage = excluded.usage,
                last_checkpoint_id = excluded.last_checkpoint_id,
                updated_at = excluded.updated_at",
            params![
                turn.id,
                turn.conversation_id,
                turn.previous_turn_id,
                turn.status().as_str(),
                serde_json::to_string(&turn.state)?,
                serde_json::to_string(&turn.entries)?,
                i64::try_from(turn.base_len).unwrap_or(i64::MAX),
                serde_json::to_string(&turn.usage)?,
                turn.last_checkpoint_id,
                turn.created_at.to_rfc3339(),
                turn.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Get a turn, scoped to its conversation
    pub fn get_turn(&self, conversation_id: &str, turn_id: &str) -> DbResult<TurnRecord> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {TURN_COLUMNS} FROM turns WHERE id = ?1 AND conversation_id = ?2"
                ),
                params![turn_id, conversation_id],
                RawTurn::from_row,
            )
            .optional()?;
        raw.ok_or_else(|| DbError::TurnNotFound(turn_id.to_string()))?
            .decode()
    }

    /// Most recently created turn with the given status
    pub fn latest_turn(
        &self,
        conversation_id: &str,
        status: TurnStatus,
    ) -> DbResult<Option<TurnRecord>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {TURN_COLUMNS} FROM turns
                     WHERE conversation_id = ?1 AND status = ?2
                     ORDER BY seq DESC LIMIT 1"
                ),
                params![conversation_id, status.as_str()],
                RawTurn::from_row,
            )
            .optional()?;
        raw.map(RawTurn::decode).transpose()
    }

    // ==================== Checkpoint Operations ====================

    /// Append a snapshot and return its id
    pub fn append_checkpoint(
        &self,
        conversation_id: &str,
        turn_id: &str,
        state: &TurnState,
        entries: &[Entry],
        parent_id: Option<&str>,
    ) -> DbResult<String> {
        let conn = self.conn()?;
        insert_checkpoint(&conn, conversation_id, turn_id, state, entries, parent_id)
    }

    /// Checkpoint summaries in creation order
    pub fn list_checkpoints(&self, conversation_id: &str) -> DbResult<Vec<CheckpointSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE conversation_id = ?1 ORDER BY seq"
        ))?;
        let rows = stmt.query_map(params![conversation_id], RawCheckpoint::from_row)?;
        let summaries = rows
            .map(|row| Ok(row?.decode()?.summary))
            .collect::<DbResult<Vec<_>>>()?;
        Ok(summaries)
    }

    /// Load a checkpoint, verifying it belongs to the conversation
    pub fn resume_checkpoint(
        &self,
        conversation_id: &str,
        checkpoint_id: &str,
    ) -> DbResult<ResumedCheckpoint> {
        let conn = self.conn()?;
        load_checkpoint(&conn, conversation_id, checkpoint_id)
    }

    /// Fork a checkpoint with replacement entries.
    ///
    /// The original is untouched; the new checkpoint takes the original's
    /// parent, turn and state.
    pub fn edit_checkpoint(
        &self,
        conversation_id: &str,
        checkpoint_id: &str,
        entries: &[Entry],
    ) -> DbResult<String> {
        let conn = self.conn()?;
        let original = load_checkpoint(&conn, conversation_id, checkpoint_id)?;
        insert_checkpoint(
            &conn,
            conversation_id,
            &original.summary.turn_id,
            &original.state,
            entries,
            original.summary.parent_id.as_deref(),
        )
    }
}

// ==================== Row helpers ====================

fn insert_checkpoint(
    conn: &Connection,
    conversation_id: &str,
    turn_id: &str,
    state: &TurnState,
    entries: &[Entry],
    parent_id: Option<&str>,
) -> DbResult<String> {
    let id = format!("ckpt_{}", uuid::Uuid::new_v4().simple());
    let inserted = conn.execute(
        "INSERT INTO checkpoints (id, conversation_id, turn_id, seq, parent_id, status, state, entries, created_at)
         SELECT ?1, ?2, ?3,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM checkpoints WHERE conversation_id = ?2),
                ?4, ?5, ?6, ?7, ?8
         WHERE EXISTS (SELECT 1 FROM conversations WHERE id = ?2)",
        params![
            id,
            conversation_id,
            turn_id,
            parent_id,
            state.status().as_str(),
            serde_json::to_string(state)?,
            serde_json::to_string(entries)?,
            Utc::now().to_rfc3339(),
        ],
    )?;
    if inserted == 0 {
        return Err(DbError::ConversationNotFound(conversation_id.to_string()));
    }
    Ok(id)
}

fn load_checkpoint(
    conn: &Connection,
    conversation_id: &str,
    checkpoint_id: &str,
) -> DbResult<ResumedCheckpoint> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE id = ?1 AND conversation_id = ?2"
            ),
            params![checkpoint_id, conversation_id],
            RawCheckpoint::from_row,
        )
        .optional()?;
    raw.ok_or_else(|| DbError::CheckpointNotFound(checkpoint_id.to_string()))?
        .decode()
}

/// Turn row with JSON columns still encoded
struct RawTurn {
    id: String,
    conversation_id: String,
    previous_turn_id: Option<String>,
    state: String,
    entries: String,
    base_len: i64,
    usage: String,
    last_checkpoint_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawTurn {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            previous_turn_id: row.get(2)?,
            state: row.get(3)?,
            entries: row.get(4)?,
            base_len: row.get(5)?,
            usage: row.get(6)?,
            last_checkpoint_id: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn decode(self) -> DbResult<TurnRecord> {
        Ok(TurnRecord {
            id: self.id,
            conversation_id: self.conversation_id,
            previous_turn_id: self.previous_turn_id,
            state: serde_json::from_str(&self.state)?,
            entries: serde_json::from_str(&self.entries)?,
            base_len: usize::try_from(self.base_len).unwrap_or_default(),
            usage: serde_json::from_str(&self.usage)?,
            store: true,
            last_checkpoint_id: self.last_checkpoint_id,
            created_at: parse_datetime(&self.created_at),
            updated_at: parse_datetime(&self.updated_at),
        })
    }
}

/// Checkpoint row with JSON columns still encoded
struct RawCheckpoint {
    id: String,
    conversation_id: String,
    turn_id: String,
    seq: i64,
    parent_id: Option<String>,
    entries: String,
    created_at: String,
    state: String,
}

impl RawCheckpoint {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            turn_id: row.get(2)?,
            seq: row.get(3)?,
            parent_id: row.get(4)?,
            entries: row.get(6)?,
            created_at: row.get(7)?,
            state: row.get(8)?,
        })
    }

    fn decode(self) -> DbResult<ResumedCheckpoint> {
        let state: TurnState = serde_json::from_str(&self.state)?;
        let entries: Vec<Entry> = serde_json::from_str(&self.entries)?;
        Ok(ResumedCheckpoint {
            summary: CheckpointSummary {
                id: self.id,
                conversation_id: self.conversation_id,
                turn_id: self.turn_id,
                seq: self.seq,
                parent_id: self.parent_id,
                status: state.status(),
                entry_count: entries.len(),
                created_at: parse_datetime(&self.created_at),
            },
            entries,
            state,
        })
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
