//! Access control gate
//!
//! Every conversation reference is resolved to a canonical, user-scoped id
//! before any turn or checkpoint operation runs. Ownership is fixed by the
//! first identity to use an id and never changes afterwards.

use crate::audit::AuditRecord;
use crate::error::TurnError;
use crate::runtime::{AuditSink, ConversationStore};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};

/// Separator between the owner namespace and the local part of an id
pub const NAMESPACE_SEPARATOR: &str = "::";

static LOCAL_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_.\-]{1,128}$").expect("literal pattern compiles")
});

/// Authenticated caller, always derived from a validated credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Whether a user id (or local reference) is acceptable inside an id
pub fn is_valid_name(name: &str) -> bool {
    LOCAL_REF.is_match(name)
}

/// Parsed form of a caller-supplied conversation reference
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reference {
    /// Bare name, joined onto the caller's namespace
    Local(String),
    /// Already namespaced id, e.g. `alice::orders`
    Qualified(String),
}

fn parse_reference(reference: &str) -> Result<Reference, TurnError> {
    match reference.split_once(NAMESPACE_SEPARATOR) {
        Some((namespace, local)) => {
            if !is_valid_name(namespace) || !is_valid_name(local) {
                return Err(TurnError::validation(format!(
                    "invalid conversation id '{reference}'"
                )));
            }
            Ok(Reference::Qualified(reference.to_string()))
        }
        None if is_valid_name(reference) => Ok(Reference::Local(reference.to_string())),
        None => Err(TurnError::validation(format!(
            "invalid conversation reference '{reference}': use 1-128 characters from [A-Za-z0-9_.-]"
        ))),
    }
}

/// Canonical id for `reference` as seen by `user_id`
pub fn canonical_id(user_id: &str, reference: &str) -> Result<String, TurnError> {
    Ok(match parse_reference(reference)? {
        Reference::Local(local) => format!("{user_id}{NAMESPACE_SEPARATOR}{local}"),
        Reference::Qualified(id) => id,
    })
}

/// How `resolve` treats a conversation that does not exist yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Create it, owned by the caller
    CreateIfMissing,
    /// Report it as not found
    ExistingOnly,
}

/// Proof that an identity may act on a conversation.
///
/// Only the gate can construct one.
#[derive(Debug, Clone)]
pub struct Authorized {
    identity: Identity,
    conversation_id: String,
    created: bool,
}

impl Authorized {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// True when this resolution created the conversation
    pub fn created(&self) -> bool {
        self.created
    }
}

pub struct AccessGate {
    store: Arc<dyn ConversationStore>,
    audit: Arc<dyn AuditSink>,
}

impl AccessGate {
    pub fn new(store: Arc<dyn ConversationStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    /// Resolve a caller-supplied reference to a conversation the caller owns
    pub async fn resolve(
        &self,
        identity: &Identity,
        reference: Option<&str>,
        mode: Resolution,
    ) -> Result<Authorized, TurnError> {
        let canonical = match reference {
            Some(r) => canonical_id(&identity.user_id, r)?,
            None if mode == Resolution::CreateIfMissing => format!(
                "{}{NAMESPACE_SEPARATOR}{}",
                identity.user_id,
                uuid::Uuid::new_v4().simple()
            ),
            None => return Err(TurnError::validation("conversation id is required")),
        };
        let namespace = canonical
            .split_once(NAMESPACE_SEPARATOR)
            .map_or_else(|| canonical.clone(), |(namespace, _)| namespace.to_string());

        match self.store.conversation_owner(&canonical).await? {
            Some(owner) if owner == identity.user_id => {
                self.audit(identity, &canonical, "allowed");
                Ok(authorized(identity, canonical, false))
            }
            Some(_) => Err(self.deny(identity, &canonical)),
            // Nobody may create ids in someone else's namespace, and a
            // missing foreign id is indistinguishable from a denied one
            None if namespace != identity.user_id => Err(self.deny(identity, &canonical)),
            None if mode == Resolution::ExistingOnly => {
                self.audit(identity, &canonical, "not_found");
                Err(TurnError::NotFound(format!(
                    "conversation '{canonical}' not found"
                )))
            }
            None => {
                let owner = self
                    .store
                    .claim_conversation(&canonical, &identity.user_id)
                    .await?;
                if owner != identity.user_id {
                    return Err(self.deny(identity, &canonical));
                }
                tracing::info!(conv_id = %canonical, user_id = %identity.user_id, "Created conversation");
                self.audit(identity, &canonical, "created");
                Ok(authorized(identity, canonical, true))
            }
        }
    }

    fn deny(&self, identity: &Identity, canonical: &str) -> TurnError {
        tracing::warn!(conv_id = %canonical, user_id = %identity.user_id, "Access denied");
        self.audit(identity, canonical, "denied");
        TurnError::AccessDenied(canonical.to_string())
    }

    fn audit(&self, identity: &Identity, canonical: &str, outcome: &str) {
        self.audit.record(AuditRecord::new(
            &identity.user_id,
            "conversation.resolve",
            canonical,
            outcome,
        ));
    }
}

fn authorized(identity: &Identity, conversation_id: String, created: bool) -> Authorized {
    Authorized {
        identity: identity.clone(),
        conversation_id,
        created,
    }
}
