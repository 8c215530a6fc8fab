// Tunneldeck - control plane and observability aggregator for a fleet of
// remote tunnel-forwarding agents
//
// Architecture:
// - Supervisor: one long-lived task per endpoint consuming its SSE stream
// - Ingestor: turns frames into tunnel rows, counter deltas, and log lines
// - Aggregator: rolls samples into per-minute ServiceHistory rows
// - Fan-out hub: routes ingested events to browser SSE subscribers
// - HTTP API (axum): query, control, and import/export surface
// - Store (SQLite): typed persistence for all of the above

mod agent;
mod api;
mod auth;
mod cli;
mod config;
mod error;
mod events;
mod filelog;
mod hub;
mod ingest;
mod logging;
mod metrics;
mod model;
mod query;
mod services;
mod sse;
mod store;
mod supervisor;

use anyhow::{Context, Result};
use config::Config;
use services::Services;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    // Handle CLI commands first (config --show, --path)
    // If a command was handled, exit early
    if cli::handle_cli() {
        return Ok(());
    }

    let config = Config::from_env();

    // The guard keeps the file appender flushing until process exit
    let _log_guard = logging::init(&config.logging);

    tracing::info!(
        version = config::VERSION,
        bind = %config.bind_addr,
        db = %config.db_path.display(),
        "Starting tunneldeck"
    );

    let services = Services::init(config)?;
    services
        .start_background()
        .map_err(|e| anyhow::anyhow!("start background tasks: {e}"))?;

    // Serve the HTTP API until ctrl-c
    let state = services.app_state();
    let app = api::router(state);
    let bind_addr = services.config.bind_addr;

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {}", bind_addr);

    let shutdown_services = services.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    // Streams closed, buckets flushed, file handles synced - best effort,
    // bounded by the runtime's own teardown
    shutdown_services.shutdown();

    tracing::info!("Shutdown complete");
    Ok(())
}
