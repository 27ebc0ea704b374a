//! WebSocket and HTTP handlers.
//!
//! The connection handlers own no session state: the reader half of each
//! socket only enqueues commands for the coordinator, and the writer half
//! only drains that connection's outbox.

use std::sync::Arc;

use axum::{
    Json,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use tokio::sync::{mpsc, oneshot};

use super::coordinator::Command;
use super::message::{ClientCommand, JoinRequest};
use super::state::OUTBOX_CAPACITY;

/// Shared handler state: just the sending side of the command stream.
pub struct AppState {
    pub commands: mpsc::UnboundedSender<Command>,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Handshake: the first frame carries the display name.
    let name = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<JoinRequest>(&text) {
                    Ok(join) => break join.name,
                    Err(e) => {
                        tracing::warn!("malformed handshake, closing connection: {e}");
                        return;
                    }
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            _ => {
                tracing::debug!("connection closed before handshake");
                return;
            }
        }
    };

    let (outbox_tx, mut outbox_rx) = mpsc::channel::<String>(OUTBOX_CAPACITY);
    let (reply_tx, reply_rx) = oneshot::channel();
    if state
        .commands
        .send(Command::Join {
            name,
            outbox: outbox_tx,
            reply: reply_tx,
        })
        .is_err()
    {
        tracing::error!("coordinator is gone; dropping connection");
        return;
    }
    let id = match reply_rx.await {
        Ok(Ok(id)) => id,
        Ok(Err(e)) => {
            tracing::warn!("rejecting connection: {e}");
            return;
        }
        Err(_) => return,
    };

    // Reader: parse inbound commands and feed them to the coordinator.
    let commands = state.commands.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!("websocket read error for {id}: {e}");
                    break;
                }
            };
            match msg {
                Message::Text(text) => {
                    match serde_json::from_str::<ClientCommand>(&text) {
                        Ok(command) => {
                            if commands.send(Command::Client { id, command }).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            // Protocol error: discard, keep the connection.
                            tracing::warn!("unparseable message from {id}: {e}");
                        }
                    }
                }
                Message::Close(_) => {
                    tracing::debug!("{id} requested close");
                    break;
                }
                _ => {}
            }
        }
    });

    // Writer: drain this connection's outbox into the socket. Ends when the
    // coordinator drops the outbox (reset) or the socket fails.
    let mut send_task = tokio::spawn(async move {
        while let Some(json) = outbox_rx.recv().await {
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // If any one of the tasks completes, abort the other.
    tokio::select! {
        _ = &mut recv_task => send_task.abort(),
        _ = &mut send_task => recv_task.abort(),
    };

    // Safe to send twice for the same connection; unregistration is
    // idempotent in the coordinator.
    let _ = state.commands.send(Command::Leave(id));
}

/// Out-of-band administrative reset, not tied to any connection.
pub async fn reset_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let _ = state.commands.send(Command::Reset);
    Json(serde_json::json!({"message": "meeting reset"}))
}

/// Health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}
