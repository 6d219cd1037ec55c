use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use consent_engine::NotificationHub;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Upgrade to a WebSocket that receives every consent approval as a JSON text frame
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<NotificationHub>) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscription = hub.subscribe();
    let subscriber_id = subscription.id();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    debug!("Subscriber {} dropped by hub", subscriber_id);
                    break;
                };
                let frame = match serde_json::to_string(&event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("Failed to encode consent event: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error for subscriber {}: {}", subscriber_id, e);
                        break;
                    }
                }
            }
        }
    }

    hub.unsubscribe(subscriber_id);
    debug!("WebSocket subscriber {} disconnected", subscriber_id);
}
