use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use peerkit_protocol::ServerMessage;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::AppState;

/// Upgrade handler for the signaling socket.
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(state.outbound_queue());
    let hub = state.hub().clone();

    let id = match hub.connect(tx).await {
        Ok(id) => id,
        Err(err) => {
            warn!(%err, "refusing websocket");
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };
    info!(client = %id, "websocket connected");

    // Ends when the hub drops the client's sender or the peer stops reading.
    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    warn!(%err, "failed to encode outbound frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    let mut send_done = false;
    loop {
        tokio::select! {
            next = stream.next() => match next {
                // Waiting here for queue room is what throttles a chatty peer.
                Some(Ok(Message::Text(text))) => {
                    if hub.frame(&id, text.as_str().to_owned()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    debug!(client = %id, "ignoring binary frame");
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Ping/Pong are answered by axum.
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(client = %id, %err, "websocket error");
                    break;
                }
            },
            _ = &mut send_task => {
                send_done = true;
                break;
            }
        }
    }

    let _ = hub.disconnect(&id).await;
    if !send_done {
        let _ = send_task.await;
    }
    info!(client = %id, "websocket closed");
}
