// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! WebSocket bridge — wires an upgraded socket to a [`Session`].
//!
//! # Task layout
//!
//! ```text
//!   socket reader ──┐ (this function's select loop, serial dispatch)
//!                   ├──► Session ──► bounded out queue ──► writer task ──► sink
//!   event pumps  ───┘
//! ```
//!
//! The writer task is the only owner of the sink, which gives strict
//! per-session ordering without locks.  The select loop is the only place
//! frames and transport events touch the session, so no two frames from
//! the same client are ever handled concurrently.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{http::AppState, session::Session};

/// Bound on queued outbound chunks per session.  When the client stops
/// reading, the session stalls against this bound and is eventually
/// evicted rather than buffering without limit.
const OUTBOUND_QUEUE: usize = 64;

/// Capacity of the transport-event fan-in channel.
const EVENT_QUEUE: usize = 64;

/// HTTP handler for `GET /ws/chat`.
///
/// The origin check runs **before** the upgrade: a non-matching `Origin`
/// header is refused with 403 and never becomes a WebSocket.  Requests
/// without an `Origin` header (CLI clients) are allowed.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let origin = headers.get("origin").and_then(|v| v.to_str().ok());
    if !origin_allowed(origin, &state.config.server.allowed_origins) {
        warn!(origin = origin.unwrap_or(""), "websocket origin refused");
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

pub(crate) fn origin_allowed(origin: Option<&str>, allowed: &[String]) -> bool {
    match origin {
        None => true,
        Some(o) => allowed.iter().any(|a| a == o),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut inbound) = socket.split();

    let (out_tx, mut out_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let (evt_tx, mut evt_rx) = mpsc::channel(EVENT_QUEUE);

    // Writer: sole owner of the sink; chunks leave in queue order.
    let writer = tokio::spawn(async move {
        while let Some(chunk) = out_rx.recv().await {
            let Ok(json) = serde_json::to_string(&chunk) else {
                continue;
            };
            if sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = Session::new(state.config.clone(), state.factory.clone(), out_tx, evt_tx);
    let connection = session.id();
    info!(%connection, "chat client connected");

    if session.start().await.is_ok() {
        loop {
            tokio::select! {
                msg = inbound.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if session.handle_frame(&text).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        if session.reject_binary().await.is_err() {
                            break;
                        }
                    }
                    // Ping/pong is answered at the protocol layer.
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(%connection, "websocket recv error: {e}");
                        break;
                    }
                },
                Some((seq, event)) = evt_rx.recv() => {
                    if session.handle_transport_event(seq, event).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    session.close().await;
    // Dropping the session drops its queue sender; the writer drains what
    // is left and exits.
    drop(session);
    let _ = writer.await;
    info!(%connection, "chat client disconnected");
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn origins() -> Vec<String> {
        vec!["http://localhost:5173".to_string()]
    }

    #[test]
    fn matching_origin_is_allowed() {
        assert!(origin_allowed(Some("http://localhost:5173"), &origins()));
    }

    #[test]
    fn mismatched_origin_is_refused() {
        assert!(!origin_allowed(Some("https://evil.example"), &origins()));
    }

    #[test]
    fn absent_origin_is_allowed_for_non_browser_clients() {
        assert!(origin_allowed(None, &origins()));
    }
}
