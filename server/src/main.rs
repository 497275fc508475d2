//! Mend Server - REST surface for conflict resolution and duplicate merging.
//!
//! This server exposes record reads and writes, replica ingestion, streamed
//! conflict resolution and duplicate merges over a PostgreSQL revision store
//! using the mend-engine resolution logic.

mod config;
mod db;
mod error;
mod handlers;
mod routes;

use crate::config::Config;
use crate::db::PgStore;
use axum::Router;
use mend_engine::{ConflictScanner, ReplicaWriter, VersionedStore};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Everything a handler needs from the record store.
pub trait Backend: VersionedStore + ConflictScanner + ReplicaWriter {}

impl<T> Backend for T where T: VersionedStore + ConflictScanner + ReplicaWriter {}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn Backend>,
    pub config: Arc<Config>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "mend_server=debug,mend_engine=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Mend Server on {}:{}", config.host, config.port);

    // Create database pool
    let pool = db::create_pool(&config.database_url).await?;

    // Run migrations
    tracing::info!("Running database migrations...");
    db::run_migrations(&pool).await?;

    // Build application state
    let state = AppState {
        backend: Arc::new(PgStore::new(pool)),
        config: Arc::new(config.clone()),
    };

    // Build router
    let app = Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
