//! mcpd-server - worker orchestration backend
//!
//! REST API and WebSocket event stream over HTTP.

use mcpd_core::{Database, HealthMonitor};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;
mod routes;
mod state;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("mcpd_server=info".parse()?)
                .add_directive("mcpd_core=info".parse()?),
        )
        .init();

    info!("mcpd-server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = config::Config::load()?;
    info!("Data directory: {:?}", config.data_dir);

    // Open database (schema is created on first open)
    let db = Database::open_path(&config.database_path)?;
    info!("Database ready at {:?}", config.database_path);

    let state = state::AppState::new(config, db);

    // Periodic worker liveness checking
    let monitor = HealthMonitor::new(
        Arc::clone(&state.supervisor),
        state.config.orchestrator().health_check_interval,
    )
    .start();

    let app = routes::router(Arc::clone(&state)).layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(&state.config.http_addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    monitor.abort();
    state.supervisor.stop_all().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
