//! In-memory storage
//!
//! Backs turns submitted with `store: false`, which must not outlive the
//! process, and doubles as a full `Storage` for tests.

use super::traits::{CheckpointStore, ConversationStore, TurnStore};
use crate::db::{
    CheckpointSummary, DbError, DbResult, Entry, ResumedCheckpoint, TurnRecord, TurnState,
    TurnStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    owners: HashMap<String, String>,
    /// Turns per conversation in creation order
    turns: HashMap<String, Vec<TurnRecord>>,
    /// Checkpoints per conversation in creation order
    checkpoints: HashMap<String, Vec<ResumedCheckpoint>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| DbError::LockPoisoned)
    }

    /// Drop a turn and every checkpoint it wrote
    pub fn forget_turn(&self, conversation_id: &str, turn_id: &str) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if let Some(turns) = inner.turns.get_mut(conversation_id) {
            turns.retain(|t| t.id != turn_id);
        }
        if let Some(checkpoints) = inner.checkpoints.get_mut(conversation_id) {
            checkpoints.retain(|c| c.summary.turn_id != turn_id);
        }
    }

    /// True when no turn or checkpoint is held
    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .map(|inner| {
                inner.turns.values().all(Vec::is_empty)
                    && inner.checkpoints.values().all(Vec::is_empty)
            })
            .unwrap_or(false)
    }

    /// Drop every turn and checkpoint
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner = Inner::default();
        }
    }

    #[cfg(test)]
    pub fn turn_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.turns.values().map(Vec::len).sum())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn claim_conversation(&self, id: &str, owner_id: &str) -> DbResult<String> {
        let mut inner = self.lock()?;
        Ok(inner
            .owners
            .entry(id.to_string())
            .or_insert_with(|| owner_id.to_string())
            .clone())
    }

    async fn conversation_owner(&self, id: &str) -> DbResult<Option<String>> {
        Ok(self.lock()?.owners.get(id).cloned())
    }

    async fn delete_conversation(&self, id: &str) -> DbResult<()> {
        let mut inner = self.lock()?;
        if inner.owners.remove(id).is_none() {
            return Err(DbError::ConversationNotFound(id.to_string()));
        }
        inner.turns.remove(id);
        inner.checkpoints.remove(id);
        Ok(())
    }
}

#[async_trait]
impl TurnStore for MemoryStore {
    async fn save_turn(&self, turn: &TurnRecord) -> DbResult<()> {
        let mut inner = self.lock()?;
        let turns = inner.turns.entry(turn.conversation_id.clone()).or_default();
        match turns.iter_mut().find(|t| t.id == turn.id) {
            Some(existing) => *existing = turn.clone(),
            None => turns.push(turn.clone()),
        }
        Ok(())
    }

    async fn get_turn(&self, conversation_id: &str, turn_id: &str) -> DbResult<TurnRecord> {
        self.lock()?
            .turns
            .get(conversation_id)
            .and_then(|turns| turns.iter().find(|t| t.id == turn_id))
            .cloned()
            .ok_or_else(|| DbError::TurnNotFound(turn_id.to_string()))
    }

    async fn latest_turn(
        &self,
        conversation_id: &str,
        status: TurnStatus,
    ) -> DbResult<Option<TurnRecord>> {
        Ok(self.lock()?.turns.get(conversation_id).and_then(|turns| {
            turns
                .iter()
                .rev()
                .find(|t| t.status() == status)
                .cloned()
        }))
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn append(
        &self,
        conversation_id: &str,
        turn_id: &str,
        state: &TurnState,
        entries: &[Entry],
        parent_checkpoint_id: Option<&str>,
    ) -> DbResult<String> {
        let mut inner = self.lock()?;
        Ok(push_checkpoint(
            &mut inner,
            conversation_id,
            turn_id,
            state,
            entries,
            parent_checkpoint_id,
        ))
    }

    async fn list(&self, conversation_id: &str) -> DbResult<Vec<CheckpointSummary>> {
        Ok(self
            .lock()?
            .checkpoints
            .get(conversation_id)
            .map(|all| all.iter().map(|c| c.summary.clone()).collect())
            .unwrap_or_default())
    }

    async fn resume_from(
        &self,
        conversation_id: &str,
        checkpoint_id: &str,
    ) -> DbResult<ResumedCheckpoint> {
        let inner = self.lock()?;
        find_checkpoint(&inner, conversation_id, checkpoint_id)
    }

    async fn edit(
        &self,
        conversation_id: &str,
        checkpoint_id: &str,
        replacement: &[Entry],
    ) -> DbResult<String> {
        let mut inner = self.lock()?;
        let original = find_checkpoint(&inner, conversation_id, checkpoint_id)?;
        Ok(push_checkpoint(
            &mut inner,
            conversation_id,
            &original.summary.turn_id,
            &original.state,
            replacement,
            original.summary.parent_id.as_deref(),
        ))
    }
}

fn push_checkpoint(
    inner: &mut Inner,
    conversation_id: &str,
    turn_id: &str,
    state: &TurnState,
    entries: &[Entry],
    parent_id: Option<&str>,
) -> String {
    let all = inner
        .checkpoints
        .entry(conversation_id.to_string())
        .or_default();
    let id = format!("ckpt_{}", uuid::Uuid::new_v4().simple());
    let seq = all.last().map_or(1, |c| c.summary.seq + 1);
    all.push(ResumedCheckpoint {
        summary: CheckpointSummary {
            id: id.clone(),
            conversation_id: conversation_id.to_string(),
            turn_id: turn_id.to_string(),
            seq,
            parent_id: parent_id.map(String::from),
            status: state.status(),
            entry_count: entries.len(),
            created_at: Utc::now(),
        },
        entries: entries.to_vec(),
        state: state.clone(),
    });
    id
}

fn find_checkpoint(
    inner: &Inner,
    conversation_id: &str,
    checkpoint_id: &str,
) -> DbResult<ResumedCheckpoint> {
    inner
        .checkpoints
        .get(conversation_id)
        .and_then(|all| all.iter().find(|c| c.summary.id == checkpoint_id))
        .cloned()
        .ok_or_else(|| DbError::CheckpointNotFound(checkpoint_id.to_string()))
}
