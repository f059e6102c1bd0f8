//! `GET /events`: streams every published event as a JSON text frame for
//! the lifetime of the connection.

use crate::service::PresenceService;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use std::sync::Arc;
use tokio::sync::mpsc;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(service): State<Arc<PresenceService>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, service))
}

async fn handle_socket(mut socket: WebSocket, service: Arc<PresenceService>) {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let subscription = service
        .subscribe_events(Arc::new(move |event| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(event);
            })
        }))
        .await;

    let Ok(subscription) = subscription else {
        let _ = socket.close().await;
        return;
    };

    while let Some(event) = rx.recv().await {
        let Ok(json) = serde_json::to_string(&event) else { continue };
        if socket.send(Message::Text(json)).await.is_err() {
            break;
        }
    }

    let _ = service.unsubscribe_events(subscription).await;
}
