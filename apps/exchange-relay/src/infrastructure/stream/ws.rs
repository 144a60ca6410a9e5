//! WebSocket transport.
//!
//! Each socket is split: a writer task drains the session's outbound
//! channel into the sink while this task feeds inbound text frames to the
//! session.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::StreamState;

pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<StreamState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<StreamState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(state.hub.config().outbound_capacity);

    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let mut session = state.hub.connect(tx);

    if let Err(e) = session.on_connect().await {
        tracing::debug!(connection_id = session.id(), error = %e, "Greeting failed");
    } else {
        loop {
            tokio::select! {
                biased;
                () = state.shutdown.cancelled() => break,
                frame = receiver.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = session.on_message(text.as_str()).await {
                            tracing::debug!(connection_id = session.id(), error = %e, "Reply failed");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = session.id(), error = %e, "Socket error");
                        break;
                    }
                },
            }
        }
    }

    session.on_disconnect().await;
    drop(session);
    let _ = send_task.await;
}
