//! Server execution logic.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use super::coordinator::Coordinator;
use super::handler::{AppState, health_check, reset_handler, websocket_handler};
use super::signal::shutdown_signal;

/// Run the speaking-turn coordination server.
///
/// # Arguments
///
/// * `host` - The host address to bind to (e.g., "127.0.0.1")
/// * `port` - The port number to bind to (e.g., 8080)
pub async fn run_server(host: String, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    // Single command stream: connection tasks and the HTTP reset endpoint
    // produce, one coordinator task consumes.
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator::new(command_tx.clone());
    tokio::spawn(coordinator.run(command_rx));

    let app_state = Arc::new(AppState {
        commands: command_tx,
    });

    let app = Router::new()
        .route("/ws", get(websocket_handler))
        .route("/reset", post(reset_handler))
        .route("/api/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let bind_addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    tracing::info!(
        "speaking-turn server listening on {}",
        listener.local_addr()?
    );
    tracing::info!("Connect to: ws://{}/ws", bind_addr);
    tracing::info!("Press Ctrl+C to shutdown gracefully");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}
