use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use orbit_common::Role;
use tracing::debug;

use crate::hub::RelayHub;
use crate::socket::SocketCommand;
use std::sync::Arc;

/// Drive one accepted WebSocket end to end: register with the hub, run the
/// write loop off a channel so hub-side sends never block on socket I/O,
/// and feed every inbound text frame into `handle_message` until the peer
/// disconnects.
pub async fn run(socket: WebSocket, hub: Arc<RelayHub>, role: Role, user_id: String, client_id: Option<String>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let write_task = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                SocketCommand::Text(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                SocketCommand::Close { code, reason } => {
                    let frame = axum::extract::ws::CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    });

    let id = hub.register(tx, role, user_id, client_id).await;

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => hub.handle_message(id, text.as_str()).await,
            Ok(Message::Binary(bytes)) => {
                let text = String::from_utf8_lossy(&bytes);
                hub.handle_message(id, &text).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(error) => {
                debug!(%error, "websocket receive error, tearing down socket");
                break;
            }
        }
    }

    hub.unregister(id).await;
    let _ = write_task.await;
}
