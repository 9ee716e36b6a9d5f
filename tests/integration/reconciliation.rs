//! Optimistic send reconciliation against the real server stack.
//!
//! Runs two [`ChatSession`]s against an in-process server: the API side
//! goes straight to the [`ChatService`], the realtime side over real
//! WebSockets via [`RealtimeClient`]. Verifies that optimistic entries
//! resolve in place, pushed messages interleave without duplicates, and
//! unread badges track background activity.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use marketchat_client::api::{ApiError, ChatApi};
use marketchat_client::realtime::RealtimeClient;
use marketchat_client::session::ChatSession;
use marketchat_client::view::ViewEntry;

use marketchat_proto::events::ServerEvent;
use marketchat_proto::ids::{ChatId, UserId};
use marketchat_proto::model::{Chat, MessageDraft};

use marketchat_server::directory::UserDirectory;
use marketchat_server::hub::RealtimeHub;
use marketchat_server::routes::{self, AppState};
use marketchat_server::service::{ChatService, ServiceError};
use marketchat_server::store::{ConversationStore, StoreError};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// In-process API adapter
// ---------------------------------------------------------------------------

/// [`ChatApi`] implementation that calls the service directly, the way the
/// HTTP surface would on the client's behalf.
struct ServiceApi {
    service: Arc<ChatService>,
    token: String,
}

fn map_err(err: ServiceError) -> ApiError {
    match err {
        ServiceError::Unauthorized => ApiError::Unauthorized,
        ServiceError::Store(store) => match store {
            StoreError::ChatNotFound => ApiError::NotFound("chat".to_string()),
            StoreError::UserNotFound => ApiError::NotFound("user".to_string()),
            StoreError::Forbidden => ApiError::Forbidden,
            StoreError::InvalidMessage(_) | StoreError::InvalidParticipants => {
                ApiError::InvalidMessage(store.to_string())
            }
            StoreError::Conflict | StoreError::Transient => {
                ApiError::Transient(store.to_string())
            }
        },
    }
}

impl ChatApi for ServiceApi {
    async fn list_chats(&self) -> Result<Vec<Chat>, ApiError> {
        self.service.list_chats(&self.token).await.map_err(map_err)
    }

    async fn open_chat(&self, recipient: UserId) -> Result<Chat, ApiError> {
        self.service
            .open_chat(&self.token, recipient)
            .await
            .map_err(map_err)
    }

    async fn get_chat(&self, chat_id: ChatId) -> Result<Chat, ApiError> {
        self.service
            .get_chat(&self.token, chat_id)
            .await
            .map_err(map_err)
    }

    async fn send_message(
        &self,
        chat_id: ChatId,
        draft: &MessageDraft,
    ) -> Result<Chat, ApiError> {
        self.service
            .send_message(&self.token, chat_id, draft)
            .await
            .map_err(map_err)
    }

    async fn mark_read(&self, chat_id: ChatId) -> Result<bool, ApiError> {
        self.service
            .mark_read(&self.token, chat_id)
            .await
            .map_err(map_err)
    }

    async fn unread_count(&self) -> Result<u64, ApiError> {
        self.service
            .unread_count(&self.token)
            .await
            .map_err(map_err)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type Session = ChatSession<ServiceApi, RealtimeClient>;

/// Start a server with alice and bob registered.
async fn start_stack() -> (Arc<AppState>, String) {
    let directory = Arc::new(UserDirectory::new());
    directory.register("tok-alice", "alice", None).await;
    directory.register("tok-bob", "bob", None).await;

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

/// Build a live session for the given credential.
async fn connect_session(
    state: &Arc<AppState>,
    url: &str,
    token: &str,
) -> (Session, mpsc::Receiver<ServerEvent>) {
    let (realtime, events) = RealtimeClient::connect(url, token)
        .await
        .expect("realtime connect failed");
    let me = realtime.user_id();
    let api = ServiceApi {
        service: Arc::clone(&state.service),
        token: token.to_string(),
    };
    (ChatSession::new(api, realtime, me), events)
}

/// Apply the next `count` realtime events to the session.
async fn pump(session: &Session, events: &mut mpsc::Receiver<ServerEvent>, count: usize) {
    for _ in 0..count {
        let event = tokio::time::timeout(EVENT_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for a realtime event")
            .expect("realtime channel closed");
        session.handle_event(event);
    }
}

/// Poll until the chat room holds at least `expected` connections.
///
/// Room joins travel over the socket and land asynchronously; tests wait
/// for them to settle before publishing.
async fn wait_for_room(state: &Arc<AppState>, chat_id: ChatId, expected: usize) {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if state.hub.room_size(chat_id).await >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("room never reached {expected} connections");
}

/// Texts of the confirmed entries in view order.
fn confirmed_texts(session: &Session) -> Vec<String> {
    session
        .visible()
        .iter()
        .filter_map(|entry| match entry {
            ViewEntry::Confirmed(m) => m.content.clone(),
            ViewEntry::Outgoing(_) => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn optimistic_send_resolves_to_one_confirmed_entry() {
    let (state, url) = start_stack().await;
    let (alice, _alice_events) = connect_session(&state, &url, "tok-alice").await;
    let bob_id = state.directory.resolve("tok-bob").await.unwrap();

    alice.open_with(bob_id).await.unwrap();
    alice.send(MessageDraft::text("hello bob")).await.unwrap();

    let visible = alice.visible();
    assert_eq!(visible.len(), 1, "confirmation must replace, not append");
    assert!(matches!(&visible[0], ViewEntry::Confirmed(_)));
    assert_eq!(confirmed_texts(&alice), ["hello bob"]);
}

#[tokio::test]
async fn both_sides_converge_on_the_same_history() {
    let (state, url) = start_stack().await;
    let (alice, _alice_events) = connect_session(&state, &url, "tok-alice").await;
    let (bob, mut bob_events) = connect_session(&state, &url, "tok-bob").await;
    let bob_id = state.directory.resolve("tok-bob").await.unwrap();

    let chat_id = alice.open_with(bob_id).await.unwrap();
    bob.select_chat(chat_id).await.unwrap();
    wait_for_room(&state, chat_id, 2).await;

    alice.send(MessageDraft::text("is it available?")).await.unwrap();
    alice.send(MessageDraft::text("asking for a friend")).await.unwrap();
    pump(&bob, &mut bob_events, 2).await;

    assert_eq!(
        confirmed_texts(&bob),
        ["is it available?", "asking for a friend"]
    );

    // Bob replies; Alice picks it up over her own realtime link.
    let (alice2, mut alice2_events) = connect_session(&state, &url, "tok-alice").await;
    alice2.select_chat(chat_id).await.unwrap();
    wait_for_room(&state, chat_id, 3).await;
    bob.send(MessageDraft::text("yes, hardcover")).await.unwrap();
    pump(&alice2, &mut alice2_events, 1).await;

    assert_eq!(
        confirmed_texts(&alice2),
        ["is it available?", "asking for a friend", "yes, hardcover"]
    );
}

#[tokio::test]
async fn interleaved_push_and_pending_send_keep_order() {
    let (state, url) = start_stack().await;
    let (alice, _alice_events) = connect_session(&state, &url, "tok-alice").await;
    let (bob, mut bob_events) = connect_session(&state, &url, "tok-bob").await;
    let bob_id = state.directory.resolve("tok-bob").await.unwrap();

    let chat_id = alice.open_with(bob_id).await.unwrap();
    bob.select_chat(chat_id).await.unwrap();
    wait_for_room(&state, chat_id, 2).await;

    // Bob talks while Alice's send settles.
    bob.send(MessageDraft::text("morning")).await.unwrap();
    alice.send(MessageDraft::text("hi")).await.unwrap();
    pump(&bob, &mut bob_events, 1).await;

    // Bob's view: confirmed run only, no stray pending entries.
    let visible = bob.visible();
    assert!(visible.iter().all(|e| !e.is_outgoing()));
    assert_eq!(confirmed_texts(&bob), ["morning", "hi"]);
}

#[tokio::test]
async fn background_activity_bumps_the_unread_badge() {
    let (state, url) = start_stack().await;
    let (alice, _alice_events) = connect_session(&state, &url, "tok-alice").await;
    let (bob, mut bob_events) = connect_session(&state, &url, "tok-bob").await;
    let bob_id = state.directory.resolve("tok-bob").await.unwrap();

    let chat_id = alice.open_with(bob_id).await.unwrap();
    wait_for_room(&state, chat_id, 1).await;
    bob.refresh().await.unwrap();
    assert_eq!(bob.unread_total(), 0);

    // Bob is online but has not opened the chat, so the server sends an
    // activity notice to his personal room rather than the full message.
    alice.send(MessageDraft::text("new offer")).await.unwrap();
    pump(&bob, &mut bob_events, 1).await;

    assert_eq!(bob.unread_total(), 1);
    let rows = bob.conversations();
    let row = rows.iter().find(|c| c.chat_id == chat_id).unwrap();
    assert_eq!(row.preview.as_deref(), Some("new offer"));

    // Opening the chat clears the badge locally and on the server.
    bob.select_chat(chat_id).await.unwrap();
    assert_eq!(bob.unread_total(), 0);
    assert_eq!(state.service.unread_count("tok-bob").await.unwrap(), 0);
}

#[tokio::test]
async fn own_echo_via_hint_does_not_duplicate() {
    let (state, url) = start_stack().await;
    let (tab_a, _a_events) = connect_session(&state, &url, "tok-alice").await;
    let (tab_b, mut b_events) = connect_session(&state, &url, "tok-alice").await;
    let bob_id = state.directory.resolve("tok-bob").await.unwrap();

    let chat_id = tab_a.open_with(bob_id).await.unwrap();
    tab_b.select_chat(chat_id).await.unwrap();
    wait_for_room(&state, chat_id, 2).await;

    // Tab A sends; its broadcast hint is the only path to tab B.
    tab_a.send(MessageDraft::text("cross-tab")).await.unwrap();
    pump(&tab_b, &mut b_events, 1).await;
    assert_eq!(confirmed_texts(&tab_b), ["cross-tab"]);

    // Tab A itself shows the message exactly once, from the confirmation.
    assert_eq!(confirmed_texts(&tab_a), ["cross-tab"]);
    assert_eq!(tab_a.visible().len(), 1);
}

#[tokio::test]
async fn connection_liveness_tracks_the_socket() {
    let (state, url) = start_stack().await;
    let (realtime, _events) = RealtimeClient::connect(&url, "tok-alice")
        .await
        .expect("realtime connect failed");
    assert!(realtime.is_connected());

    // Server-initiated shutdown: every connection gets a close frame and
    // the client flips to disconnected once its reader observes it.
    state.hub.close_all().await;
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while realtime.is_connected() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "client never observed the close"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
