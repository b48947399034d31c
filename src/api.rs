//! HTTP API for the agentgate control plane

mod auth;
mod handlers;
mod sse;
mod types;

pub use auth::key_digest;
pub use handlers::create_router;
#[allow(unused_imports)] // Public API re-exports
pub use types::*;

use crate::access::AccessGate;
use crate::db::Database;
use crate::runtime::{
    Collaborators, CredentialStore, DatabaseStorage, Storage, Timeouts, TurnOrchestrator,
};
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<TurnOrchestrator>,
    pub gate: Arc<AccessGate>,
    pub store: Arc<dyn Storage>,
    pub credentials: Arc<dyn CredentialStore>,
}

impl AppState {
    pub fn new(db: Database, collaborators: Collaborators, timeouts: Timeouts) -> Self {
        let storage = Arc::new(DatabaseStorage::new(db));
        let store: Arc<dyn Storage> = storage.clone();
        let gate = AccessGate::new(storage.clone(), Arc::clone(&collaborators.audit));
        Self {
            orchestrator: Arc::new(TurnOrchestrator::new(
                Arc::clone(&store),
                collaborators,
                timeouts,
            )),
            gate: Arc::new(gate),
            store,
            credentials: storage,
        }
    }
}
