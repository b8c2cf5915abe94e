//! WebSocket transport for viewer connections

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::Gateway;

/// Run one viewer connection until either side closes it
pub async fn serve_socket(gateway: Gateway, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound, mut queue) = mpsc::unbounded_channel();
    let conn = gateway.connect(outbound);

    let writer = tokio::spawn(async move {
        while let Some(msg) = queue.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to encode frame: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => gateway.handle_text(&conn, &text).await,
            Ok(Message::Binary(_)) => gateway.handle_binary(&conn),
            Ok(Message::Close(_)) => break,
            // Ping/pong frames are answered by the transport
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Viewer {} socket error: {}", conn, e);
                break;
            }
        }
    }

    gateway.disconnect(&conn);
    writer.abort();
}
