//! Audit records for access and lifecycle decisions

use crate::runtime::AuditSink;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    /// e.g. `conversation.resolve`, `turn.complete`
    pub action: String,
    /// Conversation id, optionally followed by `/turn_id`
    pub resource: String,
    pub outcome: String,
}

impl AuditRecord {
    pub fn new(
        user_id: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            user_id: user_id.into(),
            action: action.into(),
            resource: resource.into(),
            outcome: outcome.into(),
        }
    }
}

/// Writes audit records to the `audit` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, record: AuditRecord) {
        tracing::info!(
            target: "audit",
            user_id = %record.user_id,
            action = %record.action,
            resource = %record.resource,
            outcome = %record.outcome,
            at = %record.timestamp.to_rfc3339(),
            "audit"
        );
    }
}
