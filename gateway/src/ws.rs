//! WebSocket push of every new reading.
//!
//! Each client gets its own hub subscription and task, so a slow or vanished
//! client never holds up the source or the other clients.

use crate::metrics::WEBSOCKET_CLIENTS;
use crate::rest::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Keeps the client count right however the connection ends
struct ClientGuard(Arc<AtomicUsize>);

impl ClientGuard {
    fn register(clients: &Arc<AtomicUsize>) -> Self {
        let count = clients.fetch_add(1, Ordering::SeqCst) + 1;
        WEBSOCKET_CLIENTS.set(count as i64);
        Self(clients.clone())
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let count = self.0.fetch_sub(1, Ordering::SeqCst) - 1;
        WEBSOCKET_CLIENTS.set(count as i64);
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4();
    let _guard = ClientGuard::register(&state.websocket_clients);
    info!(%client_id, "Client connected to WebSocket");

    // Subscribing hands us the current reading first
    let mut updates = state.hub.subscribe();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            reading = updates.recv() => {
                let Some(reading) = reading else {
                    break;
                };
                let payload = match serde_json::to_string(reading.as_ref()) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!("Failed to serialize reading: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sender.send(Message::Text(payload)).await {
                    debug!(%client_id, "WebSocket send failed: {}", e);
                    break;
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(%client_id, "WebSocket error: {}", e);
                        break;
                    }
                    // Clients have nothing to say; pings are answered by axum
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    info!(%client_id, "Client disconnected from WebSocket");
}
