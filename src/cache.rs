//! Response cache keyed by conversation-context fingerprints

use crate::access::Identity;
use crate::db::Entry;
use crate::runtime::ResponseCache;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// A previously produced answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedAnswer {
    pub text: String,
}

/// Fingerprint of a conversation context.
///
/// Entry ids are left out so that identical histories produced by
/// different turns hash the same. Object keys serialize in sorted order.
pub fn fingerprint(entries: &[Entry]) -> String {
    let canonical: Vec<Value> = entries
        .iter()
        .map(|entry| match entry {
            Entry::Message { role, content, .. } => json!({
                "type": "message",
                "role": role,
                "content": content,
            }),
            Entry::ToolCall {
                name, arguments, ..
            } => json!({
                "type": "tool_call",
                "name": name,
                "arguments": arguments,
            }),
            Entry::ToolResult {
                payload, is_error, ..
            } => json!({
                "type": "tool_result",
                "payload": payload,
                "is_error": is_error,
            }),
        })
        .collect();
    let bytes = Value::Array(canonical).to_string();
    URL_SAFE_NO_PAD.encode(Sha256::digest(bytes.as_bytes()))
}

// ============================================================================
// Bounded in-memory cache
// ============================================================================

type CacheKey = (String, String);

#[derive(Default)]
struct Slots {
    answers: HashMap<CacheKey, CachedAnswer>,
    /// Insertion order for eviction
    order: VecDeque<CacheKey>,
}

/// Exact-match cache holding at most `capacity` answers, oldest evicted first
pub struct MemoryCache {
    capacity: usize,
    slots: Mutex<Slots>,
}

impl MemoryCache {
    /// A capacity of zero disables caching
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Mutex::new(Slots::default()),
        }
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn lookup(&self, identity: &Identity, fingerprint: &str) -> Option<CachedAnswer> {
        let slots = self.slots.lock().ok()?;
        slots
            .answers
            .get(&(identity.user_id.clone(), fingerprint.to_string()))
            .cloned()
    }

    async fn store(&self, identity: &Identity, fingerprint: &str, answer: CachedAnswer) {
        if self.capacity == 0 {
            return;
        }
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        let key = (identity.user_id.clone(), fingerprint.to_string());
        if slots.answers.insert(key.clone(), answer).is_none() {
            slots.order.push_back(key);
        }
        while slots.answers.len() > self.capacity {
            let Some(oldest) = slots.order.pop_front() else {
                break;
            };
            slots.answers.remove(&oldest);
        }
    }
}
