//! Signaling WebSocket handler and HTTP status endpoints.
//!
//! Connection flow:
//!
//! 1. Client connects to /ws (anonymous)
//! 2. Sends `register_device` with its device id
//! 3. Sends `call_device` to ring a whitelisted peer
//! 4. Peers exchange `webrtc_offer` / `webrtc_answer` / `ice_candidate` through the relay
//! 5. `end_call` or a disconnect tears the call down
//!
//! Each connection gets a writer task draining its outbound queue, so relaying
//! to a peer never waits on that peer's socket.

use crate::RelayState;
use crate::connection::ConnectionHandle;
use crate::lifecycle;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::router;
use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;

/// Build the signaling router: status at `/`, JSON stats at `/stats`, WebSocket at `/ws`.
pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/stats", get(stats))
        .route("/ws", get(ws_handler))
        .with_state(Arc::new(state))
}

/// Plain-text liveness report.
async fn status(State(state): State<Arc<RelayState>>) -> String {
    format!(
        "Signaling Server is Running! Connected devices: {}",
        state.registry.count().await
    )
}

async fn stats(State(state): State<Arc<RelayState>>) -> Json<crate::RelayStats> {
    Json(state.stats().await)
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Handle a single signaling WebSocket connection.
async fn handle_connection(socket: WebSocket, state: Arc<RelayState>) {
    let (mut sender, mut receiver) = socket.split();
    let (connection, mut outbound) = ConnectionHandle::open();
    lifecycle::on_connect(&connection);

    // ── Writer task ──────────────────────────────────────────────────────────
    let connection_id = connection.id();
    let send_task = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!(connection = %connection_id, "Failed to encode event: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // ── Receive loop ─────────────────────────────────────────────────────────
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                let result = match ClientEvent::parse(text.as_str()) {
                    Ok(event) => {
                        let name = event.name();
                        router::dispatch(&state, &connection, event)
                            .await
                            .inspect_err(|e| {
                                tracing::debug!(
                                    connection = %connection_id,
                                    event = name,
                                    code = e.error_code(),
                                    "Signaling request rejected: {e}"
                                );
                            })
                    }
                    Err(e) => {
                        tracing::debug!(connection = %connection_id, "Invalid signaling frame: {e}");
                        Err(e)
                    }
                };

                if let Err(e) = result {
                    connection.send(ServerEvent::error(&e));
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // ── Cleanup ───────────────────────────────────────────────────────────────
    lifecycle::on_disconnect(&state, &connection).await;
    send_task.abort();
    tracing::info!(connection = %connection_id, "Signaling connection closed");
}
