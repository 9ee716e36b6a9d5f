//! WebSocket connection lifecycle for the realtime hub.
//!
//! Each upgraded connection walks the hub's per-connection state machine:
//! it must identify first (binding a user and joining that user's
//! personal room), may then join chat rooms for the conversations it is
//! viewing, and is fully unregistered on disconnect.
//!
//! Outbound frames flow through an unbounded channel into a dedicated
//! writer task, so hub broadcasts never block on a slow socket.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use marketchat_proto::codec;
use marketchat_proto::events::{ClientEvent, ServerEvent};
use tokio::sync::mpsc;

use crate::routes::AppState;

/// Handles an upgraded WebSocket connection.
///
/// Lifecycle:
/// 1. Wait for an `Identify` event and resolve its credential.
/// 2. Register with the hub, bind the user, send `Identified` back.
/// 3. Spawn a writer task draining the outbound channel.
/// 4. Run the reader loop, feeding client events to the hub.
/// 5. On disconnect, drop all hub memberships.
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // The connection is anonymous until it identifies.
    let Some(user) = wait_for_identify(&mut ws_receiver, &state).await else {
        tracing::warn!("connection closed before a valid identify");
        let reject = ServerEvent::Error {
            reason: "identify with a valid credential first".to_string(),
        };
        if let Ok(bytes) = codec::encode(&reject) {
            let _ = ws_sender.send(WsMessage::Binary(bytes.into())).await;
        }
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let conn = state.hub.connect(tx).await;
    if let Err(e) = state.hub.identify(conn, user).await {
        tracing::error!(conn = %conn, error = %e, "failed to bind fresh connection");
        return;
    }

    let ack = ServerEvent::Identified { user_id: user };
    match codec::encode(&ack) {
        Ok(bytes) => {
            if ws_sender.send(WsMessage::Binary(bytes.into())).await.is_err() {
                tracing::warn!(conn = %conn, "failed to send identify ack");
                state.hub.disconnect(conn).await;
                return;
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to encode identify ack");
            state.hub.disconnect(conn).await;
            return;
        }
    }

    tracing::info!(conn = %conn, user = %user, "realtime connection established");

    // Writer task: forwards hub pushes to the socket.
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!("WebSocket write failed");
                break;
            }
        }
    });

    // Reader loop: processes client events until the peer goes away.
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                WsMessage::Binary(data) => {
                    handle_client_event(conn, &data, &reader_state).await;
                }
                WsMessage::Close(_) => {
                    tracing::info!(conn = %conn, "received close frame");
                    break;
                }
                _ => {
                    // Ignore text, ping, pong frames.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.hub.disconnect(conn).await;
    tracing::info!(conn = %conn, user = %user, "realtime connection closed");
}

/// Waits for the first event on the socket, expecting `Identify`.
///
/// Returns the resolved user id, or `None` if the connection closes, the
/// first event is not an identify, or the credential is unknown.
async fn wait_for_identify(
    receiver: &mut (impl StreamExt<Item = Result<WsMessage, axum::Error>> + Unpin),
    state: &Arc<AppState>,
) -> Option<marketchat_proto::ids::UserId> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            WsMessage::Binary(data) => match codec::decode::<ClientEvent>(&data) {
                Ok(ClientEvent::Identify { token }) => {
                    match state.directory.resolve(&token).await {
                        Some(user) => return Some(user),
                        None => {
                            tracing::warn!("identify with unknown credential");
                            return None;
                        }
                    }
                }
                Ok(other) => {
                    tracing::warn!(event = ?other, "expected Identify as the first event");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode identify frame");
                    return None;
                }
            },
            WsMessage::Close(_) => return None,
            _ => {
                // Skip ping/pong frames during identification.
            }
        }
    }
    None
}

/// Dispatches a decoded client event from an identified connection.
async fn handle_client_event(conn: crate::hub::ConnId, data: &[u8], state: &Arc<AppState>) {
    let event = match codec::decode::<ClientEvent>(data) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(conn = %conn, error = %e, "failed to decode client event");
            let error = ServerEvent::Error {
                reason: "malformed event".to_string(),
            };
            state.hub.send_to(conn, &error).await;
            return;
        }
    };

    match event {
        ClientEvent::Identify { token } => {
            // Re-identify rebinds the connection (tab switched accounts).
            match state.directory.resolve(&token).await {
                Some(user) => {
                    if state.hub.identify(conn, user).await.is_ok() {
                        let ack = ServerEvent::Identified { user_id: user };
                        state.hub.send_to(conn, &ack).await;
                    }
                }
                None => {
                    let error = ServerEvent::Error {
                        reason: "unknown credential".to_string(),
                    };
                    state.hub.send_to(conn, &error).await;
                }
            }
        }
        ClientEvent::JoinRoom { chat_id } => {
            if let Err(e) = state.hub.join_room(conn, chat_id).await {
                tracing::warn!(conn = %conn, chat_id = %chat_id, error = %e, "join failed");
                let error = ServerEvent::Error {
                    reason: e.to_string(),
                };
                state.hub.send_to(conn, &error).await;
            }
        }
        ClientEvent::BroadcastHint { chat_id, message } => {
            if let Err(e) = state.hub.broadcast_hint(conn, chat_id, &message).await {
                tracing::debug!(conn = %conn, chat_id = %chat_id, error = %e, "hint dropped");
            }
        }
    }
}
