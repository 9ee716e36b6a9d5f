//! Realtime fanout over real WebSocket connections.
//!
//! Starts the full server on an OS-assigned port, attaches tungstenite
//! clients, and verifies the delivery matrix:
//!
//! 1. Room members other than the sender get exactly one `MessageReceived`.
//! 2. The sender's own connections get nothing from the publish; a
//!    `BroadcastHint` is what reaches the sender's other tabs.
//! 3. Participants identified but outside the room get a `ChatActivity`
//!    notice in their personal room.
//! 4. Room delivery follows persistence order under concurrent senders.
//! 5. Sockets that never identify are rejected.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use marketchat_proto::codec;
use marketchat_proto::events::{ClientEvent, ServerEvent};
use marketchat_proto::ids::ChatId;
use marketchat_proto::model::MessageDraft;

use marketchat_server::directory::UserDirectory;
use marketchat_server::hub::RealtimeHub;
use marketchat_server::routes::{self, AppState};
use marketchat_server::service::ChatService;
use marketchat_server::store::ConversationStore;

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_TIMEOUT: Duration = Duration::from_millis(300);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Start a full server with three registered users.
///
/// Returns the state (for driving sends through the service) and the ws URL.
async fn start_stack() -> (Arc<AppState>, String) {
    let directory = Arc::new(UserDirectory::new());
    directory.register("tok-alice", "alice", None).await;
    directory.register("tok-bob", "bob", None).await;
    directory.register("tok-carla", "carla", None).await;

    let store = Arc::new(ConversationStore::new(Arc::clone(&directory)));
    let hub = Arc::new(RealtimeHub::new());
    let service = Arc::new(ChatService::new(
        Arc::clone(&directory),
        store,
        Arc::clone(&hub),
    ));
    let state = Arc::new(AppState {
        directory,
        service,
        hub,
    });

    let (addr, _handle) = routes::start_server("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start test server");
    (state, format!("ws://{addr}/ws"))
}

/// Connect a socket and complete the identify handshake.
async fn identified_client(url: &str, token: &str) -> WsClient {
    let (mut ws, _) = connect_async(url).await.expect("ws connect failed");
    let identify = ClientEvent::Identify {
        token: token.to_string(),
    };
    ws.send(WsMessage::Binary(codec::encode(&identify).unwrap().into()))
        .await
        .unwrap();

    match recv_event(&mut ws).await {
        ServerEvent::Identified { .. } => ws,
        other => panic!("expected Identified, got {other:?}"),
    }
}

/// Subscribe a client to a chat room.
async fn join_room(ws: &mut WsClient, chat_id: ChatId) {
    let join = ClientEvent::JoinRoom { chat_id };
    ws.send(WsMessage::Binary(codec::encode(&join).unwrap().into()))
        .await
        .unwrap();
}

/// Receive and decode the next server event, skipping control frames.
async fn recv_event(ws: &mut WsClient) -> ServerEvent {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a server event")
            .expect("connection closed")
            .expect("ws read error");
        match frame {
            WsMessage::Binary(data) => {
                return codec::decode::<ServerEvent>(&data).expect("undecodable frame");
            }
            WsMessage::Close(_) => panic!("connection closed while waiting for an event"),
            _ => {}
        }
    }
}

/// Assert that no event arrives on the socket within the quiet window.
async fn assert_silent(ws: &mut WsClient) {
    let outcome = tokio::time::timeout(QUIET_TIMEOUT, ws.next()).await;
    match outcome {
        Err(_) => {} // quiet, as expected
        Ok(Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_)))) => {}
        Ok(other) => panic!("expected silence, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn recipient_in_room_gets_exactly_one_copy() {
    let (state, url) = start_stack().await;
    let bob_id = state.directory.resolve("tok-bob").await.unwrap();
    let chat = state.service.open_chat("tok-alice", bob_id).await.unwrap();

    let mut alice_ws = identified_client(&url, "tok-alice").await;
    let mut bob_ws = identified_client(&url, "tok-bob").await;
    join_room(&mut alice_ws, chat.id).await;
    join_room(&mut bob_ws, chat.id).await;

    // Rooms settle asynchronously; wait until both joins are visible.
    wait_for_room(&state, chat.id, 2).await;

    let sent = state
        .service
        .send_message("tok-alice", chat.id, &MessageDraft::text("still available?"))
        .await
        .unwrap();
    let sent_id = sent.messages.last().unwrap().id;

    match recv_event(&mut bob_ws).await {
        ServerEvent::MessageReceived { chat_id, message } => {
            assert_eq!(chat_id, chat.id);
            assert_eq!(message.id, sent_id);
            assert_eq!(message.content.as_deref(), Some("still available?"));
        }
        other => panic!("expected MessageReceived, got {other:?}"),
    }

    // Exactly one copy for Bob, none for the sender.
    assert_silent(&mut bob_ws).await;
    assert_silent(&mut alice_ws).await;
}

#[tokio::test]
async fn broadcast_hint_reaches_the_senders_other_tab() {
    let (state, url) = start_stack().await;
    let bob_id = state.directory.resolve("tok-bob").await.unwrap();
    let chat = state.service.open_chat("tok-alice", bob_id).await.unwrap();

    let mut tab_a = identified_client(&url, "tok-alice").await;
    let mut tab_b = identified_client(&url, "tok-alice").await;
    join_room(&mut tab_a, chat.id).await;
    join_room(&mut tab_b, chat.id).await;
    wait_for_room(&state, chat.id, 2).await;

    let sent = state
        .service
        .send_message("tok-alice", chat.id, &MessageDraft::text("from tab a"))
        .await
        .unwrap();
    let message = sent.messages.last().unwrap().clone();

    // The publish skipped both of Alice's connections.
    assert_silent(&mut tab_a).await;
    assert_silent(&mut tab_b).await;

    // The sending tab hints, and only the other tab hears it.
    let hint = ClientEvent::BroadcastHint {
        chat_id: chat.id,
        message: message.clone(),
    };
    tab_a
        .send(WsMessage::Binary(codec::encode(&hint).unwrap().into()))
        .await
        .unwrap();

    match recv_event(&mut tab_b).await {
        ServerEvent::MessageReceived {
            chat_id,
            message: echoed,
        } => {
            assert_eq!(chat_id, chat.id);
            assert_eq!(echoed.id, message.id);
        }
        other => panic!("expected MessageReceived from hint, got {other:?}"),
    }
    assert_silent(&mut tab_a).await;
}

#[tokio::test]
async fn participant_outside_the_room_gets_an_activity_notice() {
    let (state, url) = start_stack().await;
    let bob_id = state.directory.resolve("tok-bob").await.unwrap();
    let chat = state.service.open_chat("tok-alice", bob_id).await.unwrap();

    let mut alice_ws = identified_client(&url, "tok-alice").await;
    join_room(&mut alice_ws, chat.id).await;
    wait_for_room(&state, chat.id, 1).await;

    // Bob is online but looking at a different screen.
    let mut bob_ws = identified_client(&url, "tok-bob").await;

    let updated = state
        .service
        .send_message("tok-alice", chat.id, &MessageDraft::text("ping"))
        .await
        .unwrap();

    match recv_event(&mut bob_ws).await {
        ServerEvent::ChatActivity {
            chat_id,
            preview,
            from,
            timestamp,
        } => {
            assert_eq!(chat_id, chat.id);
            assert_eq!(preview, "ping");
            assert_eq!(
                from,
                state.directory.resolve("tok-alice").await.unwrap()
            );
            assert_eq!(timestamp, updated.messages.last().unwrap().timestamp);
        }
        other => panic!("expected ChatActivity, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_senders_deliver_in_persistence_order() {
    let (state, url) = start_stack().await;
    let bob_id = state.directory.resolve("tok-bob").await.unwrap();
    let chat = state.service.open_chat("tok-alice", bob_id).await.unwrap();

    // Carla only watches the room, so every publish reaches her socket.
    let mut carla_ws = identified_client(&url, "tok-carla").await;
    join_room(&mut carla_ws, chat.id).await;
    wait_for_room(&state, chat.id, 1).await;

    let mut senders = Vec::new();
    for token in ["tok-alice", "tok-bob"] {
        let state = Arc::clone(&state);
        let chat_id = chat.id;
        senders.push(tokio::spawn(async move {
            for i in 0..25 {
                state
                    .service
                    .send_message(token, chat_id, &MessageDraft::text(format!("{token} {i}")))
                    .await
                    .unwrap();
            }
        }));
    }
    for sender in senders {
        sender.await.unwrap();
    }

    let mut delivered = Vec::new();
    for _ in 0..50 {
        match recv_event(&mut carla_ws).await {
            ServerEvent::MessageReceived { message, .. } => delivered.push(message.id),
            other => panic!("expected MessageReceived, got {other:?}"),
        }
    }

    let stored = state.service.get_chat("tok-alice", chat.id).await.unwrap();
    let persisted: Vec<_> = stored.messages.iter().map(|m| m.id).collect();
    assert_eq!(delivered, persisted);
}

#[tokio::test]
async fn non_participants_in_neither_room_hear_nothing() {
    let (state, url) = start_stack().await;
    let bob_id = state.directory.resolve("tok-bob").await.unwrap();
    let chat = state.service.open_chat("tok-alice", bob_id).await.unwrap();

    let mut carla_ws = identified_client(&url, "tok-carla").await;

    state
        .service
        .send_message("tok-alice", chat.id, &MessageDraft::text("private"))
        .await
        .unwrap();

    assert_silent(&mut carla_ws).await;
}

#[tokio::test]
async fn unidentified_socket_is_rejected() {
    let (_state, url) = start_stack().await;
    let (mut ws, _) = connect_async(&url).await.expect("ws connect failed");

    // Joining a room before identifying is a protocol violation.
    let join = ClientEvent::JoinRoom {
        chat_id: ChatId::new(),
    };
    ws.send(WsMessage::Binary(codec::encode(&join).unwrap().into()))
        .await
        .unwrap();

    match recv_event(&mut ws).await {
        ServerEvent::Error { .. } => {}
        other => panic!("expected an error event, got {other:?}"),
    }
}

#[tokio::test]
async fn bad_credential_is_rejected() {
    let (_state, url) = start_stack().await;
    let (mut ws, _) = connect_async(&url).await.expect("ws connect failed");

    let identify = ClientEvent::Identify {
        token: "tok-nobody".to_string(),
    };
    ws.send(WsMessage::Binary(codec::encode(&identify).unwrap().into()))
        .await
        .unwrap();

    match recv_event(&mut ws).await {
        ServerEvent::Error { .. } => {}
        other => panic!("expected an error event, got {other:?}"),
    }
}

/// Poll until the chat room holds `expected` connections.
async fn wait_for_room(state: &Arc<AppState>, chat_id: ChatId, expected: usize) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if state.hub.room_size(chat_id).await >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("room never reached {expected} connections");
}
