use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tokio::sync::broadcast;
use tracing::debug;

use keepsake_contracts::events::TaskEvent;

use crate::state::AppState;

/// Push-channel endpoint. Every connected socket receives every event;
/// filtering by task id is the observer's job. There is no replay for late
/// subscribers.
pub async fn handle_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let events = state.notifier.subscribe();
    ws.on_upgrade(move |socket| relay_events(socket, events))
}

async fn relay_events(mut socket: WebSocket, mut events: broadcast::Receiver<TaskEvent>) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "observer fell behind, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            inbound = socket.recv() => match inbound {
                // The channel is push-only; inbound frames are ignored.
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
}
