//! WebSocket endpoint feeding the event broadcaster.
//!
//! Each connection becomes one subscriber: outbound server messages are
//! drained from the broadcaster's channel onto the socket, inbound text
//! frames are parsed as client messages and handed to the broadcaster.
//! Closing the socket (or any socket error) removes the subscriber and
//! revokes all its topics.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use mcpd_core::broadcast::ClientMessage;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::state::AppState;

/// Upgrade handler for `/ws`
pub async fn websocket(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<AppState>, socket: WebSocket) {
    let (client_id, mut events) = state.broadcaster.connect().await;
    let (mut sink, mut stream) = socket.split();

    // Drain broadcaster events onto the socket
    let writer = tokio::spawn(async move {
        while let Some(message) = events.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize server message");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(client_message) => {
                    state
                        .broadcaster
                        .handle_message(&client_id, client_message)
                        .await;
                }
                Err(e) => {
                    warn!(client_id = %client_id, error = %e, "Unknown subscriber message");
                }
            },
            Message::Close(_) => break,
            // Control frames are handled by axum
            _ => {}
        }
    }

    debug!(client_id = %client_id, "WebSocket connection ended");
    state.broadcaster.disconnect(&client_id).await;
    writer.abort();
}
