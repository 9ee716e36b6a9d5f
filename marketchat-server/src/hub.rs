//! Realtime hub: connection registry, rooms, and message fanout.
//!
//! The hub tracks live WebSocket connections, which user each connection
//! is bound to (its personal room), and which chat rooms it has joined.
//! It only forwards — the conversation store stays authoritative, and a
//! client that misses a push catches up on its next chat fetch.
//!
//! Delivery is copy-then-send: membership is snapshotted under the
//! registry lock, then frames are pushed into per-connection channels
//! with the lock released, so one slow socket cannot stall a broadcast.

use std::collections::{HashMap, HashSet};

use axum::extract::ws::Message as WsMessage;
use marketchat_proto::codec;
use marketchat_proto::events::ServerEvent;
use marketchat_proto::ids::{ChatId, UserId};
use marketchat_proto::model::Message;
use tokio::sync::{RwLock, mpsc};

/// Opaque identifier for one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Errors that can occur during hub operations.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The connection id is not registered (already disconnected).
    #[error("unknown connection")]
    UnknownConnection,
    /// The connection has not identified yet.
    #[error("connection has not identified")]
    NotIdentified,
}

/// One registered connection: its outbound channel, bound user, and
/// joined rooms.
struct Connection {
    sender: mpsc::UnboundedSender<WsMessage>,
    user: Option<UserId>,
    rooms: HashSet<ChatId>,
}

#[derive(Default)]
struct HubInner {
    connections: HashMap<ConnId, Connection>,
    /// Personal rooms: every connection bound to a user.
    users: HashMap<UserId, HashSet<ConnId>>,
    /// Chat rooms: connections actively viewing a chat.
    rooms: HashMap<ChatId, HashSet<ConnId>>,
}

impl HubInner {
    fn drop_membership(&mut self, conn: ConnId, connection: &Connection) {
        if let Some(user) = connection.user
            && let Some(set) = self.users.get_mut(&user)
        {
            set.remove(&conn);
            if set.is_empty() {
                self.users.remove(&user);
            }
        }
        for room in &connection.rooms {
            if let Some(set) = self.rooms.get_mut(room) {
                set.remove(&conn);
                if set.is_empty() {
                    self.rooms.remove(room);
                }
            }
        }
    }
}

/// Shared realtime hub state.
///
/// Thread-safe via [`RwLock`]; membership mutations serialize through the
/// write half, broadcasts snapshot under the read half.
pub struct RealtimeHub {
    inner: RwLock<HubInner>,
    next_conn: std::sync::atomic::AtomicU64,
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeHub {
    /// Creates a new, empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HubInner::default()),
            next_conn: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Registers a new connection, storing the sender half of its outbound
    /// channel. The connection starts unidentified.
    pub async fn connect(&self, sender: mpsc::UnboundedSender<WsMessage>) -> ConnId {
        let conn = ConnId(
            self.next_conn
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        );
        let mut inner = self.inner.write().await;
        inner.connections.insert(
            conn,
            Connection {
                sender,
                user: None,
                rooms: HashSet::new(),
            },
        );
        drop(inner);
        conn
    }

    /// Binds a connection to a user, joining its personal room.
    ///
    /// A second identify on the same connection rebinds it (the previous
    /// personal-room membership is dropped); room memberships persist
    /// across a rebind.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownConnection`] if the connection has
    /// already been removed.
    pub async fn identify(&self, conn: ConnId, user: UserId) -> Result<(), HubError> {
        let mut inner = self.inner.write().await;
        let previous = inner
            .connections
            .get(&conn)
            .ok_or(HubError::UnknownConnection)?
            .user;

        if let Some(previous) = previous
            && let Some(set) = inner.users.get_mut(&previous)
        {
            set.remove(&conn);
            if set.is_empty() {
                inner.users.remove(&previous);
            }
        }

        if let Some(connection) = inner.connections.get_mut(&conn) {
            connection.user = Some(user);
        }
        inner.users.entry(user).or_default().insert(conn);
        drop(inner);

        tracing::info!(conn = %conn, user = %user, "connection identified");
        Ok(())
    }

    /// Adds the connection to a chat room.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownConnection`] or [`HubError::NotIdentified`]
    /// if the connection has not bound a user yet.
    pub async fn join_room(&self, conn: ConnId, chat_id: ChatId) -> Result<(), HubError> {
        let mut inner = self.inner.write().await;
        let connection = inner
            .connections
            .get_mut(&conn)
            .ok_or(HubError::UnknownConnection)?;
        if connection.user.is_none() {
            return Err(HubError::NotIdentified);
        }
        connection.rooms.insert(chat_id);
        inner.rooms.entry(chat_id).or_default().insert(conn);
        drop(inner);

        tracing::debug!(conn = %conn, chat_id = %chat_id, "joined room");
        Ok(())
    }

    /// Removes a connection and all its memberships.
    pub async fn disconnect(&self, conn: ConnId) {
        let mut inner = self.inner.write().await;
        if let Some(connection) = inner.connections.remove(&conn) {
            inner.drop_membership(conn, &connection);
            tracing::info!(conn = %conn, "connection removed");
        }
    }

    /// Fans a newly persisted message out to interested connections.
    ///
    /// Room members whose bound user is not the sender receive
    /// [`ServerEvent::MessageReceived`]. The sender's own connections get
    /// nothing — the sender learns from the store's return value, and its
    /// other tabs from [`broadcast_hint`](Self::broadcast_hint). Identified
    /// connections of the other participants that are *not* in the room
    /// receive a lightweight [`ServerEvent::ChatActivity`] in their
    /// personal room so unread indicators stay fresh.
    ///
    /// Best-effort, at-most-once per connection: send failures are logged
    /// and dropped, never surfaced to the sender.
    pub async fn publish(&self, chat_id: ChatId, participants: &[UserId], message: &Message) {
        let sender_user = message.sender_id;

        // Snapshot targets under the read lock, deliver after release.
        let mut room_targets: Vec<(ConnId, mpsc::UnboundedSender<WsMessage>)> = Vec::new();
        let mut activity_targets: Vec<(ConnId, mpsc::UnboundedSender<WsMessage>)> = Vec::new();
        {
            let inner = self.inner.read().await;
            let room: HashSet<ConnId> = inner
                .rooms
                .get(&chat_id)
                .cloned()
                .unwrap_or_default();

            for conn in &room {
                if let Some(connection) = inner.connections.get(conn)
                    && connection.user.is_some_and(|u| u != sender_user)
                {
                    room_targets.push((*conn, connection.sender.clone()));
                }
            }

            for participant in participants {
                if *participant == sender_user {
                    continue;
                }
                let Some(conns) = inner.users.get(participant) else {
                    continue;
                };
                for conn in conns {
                    if room.contains(conn) {
                        continue;
                    }
                    if let Some(connection) = inner.connections.get(conn) {
                        activity_targets.push((*conn, connection.sender.clone()));
                    }
                }
            }
        }

        let received = ServerEvent::MessageReceived {
            chat_id,
            message: message.clone(),
        };
        let activity = ServerEvent::ChatActivity {
            chat_id,
            preview: message.preview().to_string(),
            from: sender_user,
            timestamp: message.timestamp,
        };

        send_event_to(&room_targets, &received);
        send_event_to(&activity_targets, &activity);

        tracing::debug!(
            chat_id = %chat_id,
            message_id = %message.id,
            room = room_targets.len(),
            activity = activity_targets.len(),
            "message published"
        );
    }

    /// Mirrors a confirmed outgoing message to the origin user's *other*
    /// connections in the chat room.
    ///
    /// This covers the one audience [`publish`](Self::publish) deliberately
    /// skips: the sender's own other tabs and devices.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownConnection`] or [`HubError::NotIdentified`].
    pub async fn broadcast_hint(
        &self,
        origin: ConnId,
        chat_id: ChatId,
        message: &Message,
    ) -> Result<(), HubError> {
        let mut targets: Vec<(ConnId, mpsc::UnboundedSender<WsMessage>)> = Vec::new();
        {
            let inner = self.inner.read().await;
            let connection = inner
                .connections
                .get(&origin)
                .ok_or(HubError::UnknownConnection)?;
            let user = connection.user.ok_or(HubError::NotIdentified)?;

            if let Some(room) = inner.rooms.get(&chat_id) {
                for conn in room {
                    if *conn == origin {
                        continue;
                    }
                    if let Some(other) = inner.connections.get(conn)
                        && other.user == Some(user)
                    {
                        targets.push((*conn, other.sender.clone()));
                    }
                }
            }
        }

        let event = ServerEvent::MessageReceived {
            chat_id,
            message: message.clone(),
        };
        send_event_to(&targets, &event);
        Ok(())
    }

    /// Sends an event to a single connection, if it is still registered.
    pub async fn send_to(&self, conn: ConnId, event: &ServerEvent) {
        let sender = {
            let inner = self.inner.read().await;
            inner.connections.get(&conn).map(|c| c.sender.clone())
        };
        if let Some(sender) = sender {
            send_event_to(&[(conn, sender)], event);
        }
    }

    /// Sends a WebSocket close frame to every connection.
    ///
    /// Each writer task forwards the frame and shuts down, which the
    /// client side observes as a disconnect. Used for graceful shutdown
    /// and in tests.
    pub async fn close_all(&self) {
        let inner = self.inner.read().await;
        for (conn, connection) in &inner.connections {
            tracing::info!(conn = %conn, "sending close frame");
            let _ = connection.sender.send(WsMessage::Close(None));
        }
    }

    /// Number of connections currently in a chat room.
    pub async fn room_size(&self, chat_id: ChatId) -> usize {
        let inner = self.inner.read().await;
        inner.rooms.get(&chat_id).map_or(0, HashSet::len)
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.connections.len()
    }
}

/// Encodes an event once and pushes it into each target channel.
fn send_event_to(targets: &[(ConnId, mpsc::UnboundedSender<WsMessage>)], event: &ServerEvent) {
    let bytes = match codec::encode(event) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode server event");
            return;
        }
    };
    for (conn, sender) in targets {
        if sender.send(WsMessage::Binary(bytes.clone().into())).is_err() {
            // Writer task already gone; disconnect cleanup will follow.
            tracing::debug!(conn = %conn, "dropping push to closed connection");
        }
    }
}
