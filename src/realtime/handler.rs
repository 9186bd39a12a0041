//! WebSocket endpoint and connection loop.
//!
//! Each connection runs two halves: a writer task draining the session's
//! outbound queues into the socket, and the read loop below dispatching
//! client messages into [`CollabState`]. Bad messages get an `error` frame
//! back; only revoked access tears the connection down.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::{CollabError, ErrorCode};
use crate::realtime::message::{ClientMessage, ServerMessage};
use crate::realtime::state::CollabState;

#[derive(Debug, Deserialize)]
struct ConnectParams {
    token: String,
}

pub fn router(state: Arc<CollabState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn stats(State(state): State<Arc<CollabState>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<CollabState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.token))
}

async fn handle_socket(socket: WebSocket, state: Arc<CollabState>, token: String) {
    let (session, ctx, mut outbound) = match state.connect(&token).await {
        Ok(established) => established,
        Err(err) => {
            err.log();
            let mut socket = socket;
            if let Ok(json) = serde_json::to_string(&ServerMessage::error(&err)) {
                let _ = socket.send(Message::Text(json)).await;
            }
            let _ = socket.close().await;
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();

    // Writer: ends on its own once the session is deregistered and the
    // queue senders drop.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                let parsed: ClientMessage = match serde_json::from_str(&text) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        debug!(session = %session, error = %err, "Malformed client message");
                        let invalid = CollabError::new(
                            ErrorCode::InvalidMessage,
                            "Message could not be parsed",
                        );
                        state.send_error(session, &invalid);
                        continue;
                    }
                };
                if let Err(err) = state.handle_message(session, &ctx, parsed).await {
                    err.log();
                    state.send_error(session, &err);
                    match err.code() {
                        ErrorCode::AccessRevoked => {
                            warn!(session = %session, "Closing connection after revocation");
                            break;
                        }
                        ErrorCode::SessionExpired => {
                            warn!(session = %session, "Closing connection for expired session");
                            break;
                        }
                        _ => {}
                    }
                }
            }
            Message::Close(_) => break,
            // Axum answers pings itself; pongs need no action.
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    state.disconnect(session).await;
    let _ = writer.await;
    info!(session = %session, user = %ctx.user, "Connection closed");
}
