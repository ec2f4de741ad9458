//! Socket upgrade at `/`: on connect, send `initial-state`, thereafter
//! forward every bus event. Stateless across disconnects — every new
//! connection gets a fresh `initial-state`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tracing::debug;

use crate::bus::BusEvent;

use super::DashboardState;

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<DashboardState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<DashboardState>) {
    state.connections.fetch_add(1, Ordering::Relaxed);

    let initial = state.bus.initial_state(
        *state.current_phase.read().unwrap(),
        *state.current_chapter.read().unwrap(),
    );
    if send_json(&mut socket, &BusEvent::Initialized(initial)).await.is_err() {
        state.connections.fetch_sub(1, Ordering::Relaxed);
        return;
    }

    let mut rx = state.bus.subscribe();
    let mut pending = 0usize;

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        if pending >= state.outbound_buffer {
                            // Bounded per-subscriber outbound buffer exceeded:
                            // drop this slow subscriber rather than block the
                            // pipeline.
                            debug!("dashboard subscriber outbound buffer overflow, closing");
                            break;
                        }
                        pending += 1;
                        if send_json(&mut socket, &event).await.is_err() {
                            break;
                        }
                        pending = pending.saturating_sub(1);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = state.shutdown.notified() => {
                let _ = socket
                    .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                        code: 1000,
                        reason: "orchestrator stopped".into(),
                    })))
                    .await;
                break;
            }
            msg = socket.recv() => {
                if msg.is_none() {
                    break;
                }
            }
        }
    }

    state.connections.fetch_sub(1, Ordering::Relaxed);
}

async fn send_json(socket: &mut WebSocket, event: &BusEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(text)).await
}
