//! Request-level error taxonomy

use crate::db::DbError;
use crate::state_machine::TransitionError;
use crate::transport::IncompatibleTransport;
use thiserror::Error;

/// Errors surfaced to callers of the orchestrator, gate and stores.
///
/// Collaborator failures are not in here: they end the turn as `failed`
/// and travel inside the turn itself.
#[derive(Debug, Error)]
pub enum TurnError {
    /// Malformed request; nothing was mutated
    #[error("{0}")]
    Validation(String),
    #[error("missing or invalid credentials")]
    Unauthenticated,
    #[error("access to conversation '{0}' denied")]
    AccessDenied(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    IncompatibleTransport(#[from] IncompatibleTransport),
    /// Stale or mismatched decision, or an invalid branch reference
    #[error("{0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl TurnError {
    pub fn validation(message: impl Into<String>) -> Self {
        TurnError::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        TurnError::Conflict(message.into())
    }

    /// Stable machine-readable name
    pub fn kind(&self) -> &'static str {
        match self {
            TurnError::Validation(_) => "validation_error",
            TurnError::Unauthenticated => "authentication_error",
            TurnError::AccessDenied(_) => "access_denied",
            TurnError::NotFound(_) => "not_found",
            TurnError::IncompatibleTransport(_) => "incompatible_transport",
            TurnError::Conflict(_) => "conflict",
            TurnError::Internal(_) => "internal_error",
        }
    }
}

impl From<DbError> for TurnError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::ConversationNotFound(id) => {
                TurnError::NotFound(format!("conversation '{id}' not found"))
            }
            DbError::TurnNotFound(id) => TurnError::NotFound(format!("turn '{id}' not found")),
            DbError::CheckpointNotFound(id) => {
                TurnError::NotFound(format!("checkpoint '{id}' not found"))
            }
            other => TurnError::Internal(other.to_string()),
        }
    }
}

impl From<TransitionError> for TurnError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::InvalidDecision(message) => TurnError::Validation(message),
            TransitionError::InvalidTransition(message) => TurnError::Internal(message),
            other => TurnError::Conflict(other.to_string()),
        }
    }
}
