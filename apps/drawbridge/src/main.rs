mod handlers;
mod websocket;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use drawbridge_core::Engine;

#[derive(Debug, Parser)]
#[command(name = "drawbridge", about = "Real-time collaborative drawing backend")]
struct Cli {
    /// Port for the HTTP and WebSocket listener.
    #[arg(long, env = "DRAWBRIDGE_PORT", default_value_t = 3062)]
    port: u16,

    /// Directory holding session snapshots, logs, and file metadata.
    #[arg(long, env = "DRAWBRIDGE_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    info!(
        port = cli.port,
        data_dir = %cli.data_dir.display(),
        "starting drawbridge"
    );

    let engine = Engine::new(&cli.data_dir)
        .await
        .context("failed to open data directory")?;

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/sessions", get(handlers::list_sessions))
        .route("/api/session/:id", get(handlers::get_session))
        .route("/api/session/:id/elements", post(handlers::set_elements))
        .route("/api/session/:id/append", post(handlers::append_elements))
        .route("/api/session/:id/viewport", post(handlers::set_viewport))
        .route("/api/session/:id/clear", post(handlers::clear))
        .route("/api/session/:id/undo", post(handlers::undo))
        .route("/api/session/:id/versions", get(handlers::versions))
        .route("/api/session/:id/restore", post(handlers::restore))
        .route(
            "/api/session/:id/files",
            get(handlers::files).post(handlers::add_file),
        )
        .route("/ws/:session_id", get(websocket::websocket_handler))
        .with_state(engine.clone())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("drawbridge listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown signal received; flushing sessions");
    engine.flush_all().await;
    info!("all sessions flushed");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
