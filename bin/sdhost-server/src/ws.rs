//! WebSocket event stream, served on its own port.
//!
//! Every connection gets the current `server_status` on open, then a live
//! feed of bus frames. Client control messages: `{"type":"ping"}` answers
//! `pong`, `{"type":"get_status"}` answers `server_status`; anything
//! malformed is ignored. A connection that lags behind the bus backlog is
//! closed rather than allowed to block others.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::any;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::state::AppState;

pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/", any(upgrade))
        .route("/ws", any(upgrade))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "WebSocket server listening");

    let mut shutdown = state.bus.shutdown_signal();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stopping| *stopping).await;
        })
        .await?;
    info!("WebSocket server stopped");
    Ok(())
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    debug!(subscribers = state.bus.subscriber_count() + 1, "WebSocket client connected");

    // New clients immediately learn the current server state.
    if socket
        .send(Message::Text(state.bus.server_status_frame().into()))
        .await
        .is_err()
    {
        return;
    }

    let mut events = state.bus.subscribe();
    let mut shutdown = state.bus.shutdown_signal();

    loop {
        tokio::select! {
            frame = events.recv() => match frame {
                Ok(frame) => {
                    if socket.send(Message::Text(frame.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Too far behind; drop the connection instead of
                    // stalling producers.
                    warn!(skipped, "WebSocket client lagged; closing");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Err(RecvError::Closed) => break,
            },

            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = control_reply(&state, &text) {
                        if socket.send(Message::Text(reply.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary/ping frames: nothing to do
                Some(Err(_)) => break,
            },

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }
    debug!("WebSocket client disconnected");
}

/// Reply for a client control message; `None` for malformed input.
fn control_reply(state: &AppState, text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    match value["type"].as_str()? {
        "ping" => Some(state.bus.pong_frame()),
        "get_status" => Some(state.bus.server_status_frame()),
        _ => None,
    }
}
