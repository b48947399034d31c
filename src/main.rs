//! agentgate - multi-user conversation control plane
//!
//! Runs resumable agent conversations whose tool calls pause for a caller
//! decision, serves them as JSON or event streams, and keeps every turn
//! checkpointed and isolated per user.

mod access;
mod api;
mod audit;
mod cache;
mod config;
mod db;
mod error;
mod reasoner;
mod runtime;
mod state_machine;
mod tools;
mod transport;

use api::{create_router, key_digest, AppState};
use audit::TracingAudit;
use cache::MemoryCache;
use config::ServerConfig;
use db::Database;
use reasoner::{HttpReasoner, LoggingReasoner};
use runtime::Collaborators;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tools::HttpToolExecutor;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentgate=info,audit=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = ServerConfig::from_env()?;

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path, "Opening database");
    let db = Database::open(&config.db_path)?;

    for key in &config.api_keys {
        db.upsert_api_key(&key_digest(&key.token), &key.user_id, &key.roles)?;
    }
    if config.api_keys.is_empty() {
        tracing::warn!("No credentials configured. Set AGENTGATE_API_KEYS to seed API keys.");
    } else {
        tracing::info!(count = config.api_keys.len(), "Seeded API keys");
    }

    if config.reasoner_url.is_none() {
        tracing::warn!("No reasoner configured. Set AGENTGATE_REASONER_URL; turns will fail.");
    }

    let collaborators = Collaborators {
        reasoner: Arc::new(LoggingReasoner::new(Arc::new(HttpReasoner::new(
            config.reasoner_url.clone(),
        )))),
        tools: Arc::new(HttpToolExecutor::new(config.tool_url.clone())),
        cache: Arc::new(MemoryCache::new(config.cache_capacity)),
        audit: Arc::new(TracingAudit),
    };
    let state = AppState::new(db, collaborators, config.timeouts);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(compression);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "agentgate listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
