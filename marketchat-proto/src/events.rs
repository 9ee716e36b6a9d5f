//! Realtime channel event types.
//!
//! Defines the [`ClientEvent`] and [`ServerEvent`] enums that are
//! postcard-encoded and carried in WebSocket binary frames between
//! clients and the realtime hub. The hub only forwards — the conversation
//! store remains the source of truth, and a client that misses a push
//! catches up on its next chat fetch.

use serde::{Deserialize, Serialize};

use crate::ids::{ChatId, Timestamp, UserId};
use crate::model::Message;

/// Events sent from a client to the realtime hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientEvent {
    /// Binds the connection to a user.
    ///
    /// Must be the first event after the WebSocket upgrade. Carries the
    /// same bearer credential as the HTTP surface; the hub resolves it to
    /// an internal user id and answers with [`ServerEvent::Identified`].
    Identify {
        /// Bearer credential for the connecting user.
        token: String,
    },

    /// Joins the room for a chat the client is actively viewing.
    ///
    /// A connection may be in multiple rooms at once (one per open
    /// conversation tab). Requires a prior successful `Identify`.
    JoinRoom {
        /// The chat whose room to join.
        chat_id: ChatId,
    },

    /// Mirrors a just-confirmed outgoing message to the same user's other
    /// connections in the chat room.
    ///
    /// This is purely for UI symmetry across tabs and devices; it is not
    /// the path by which messages are persisted.
    BroadcastHint {
        /// The chat the message belongs to.
        chat_id: ChatId,
        /// The server-confirmed message, as returned by the send endpoint.
        message: Message,
    },
}

/// Events pushed from the realtime hub to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// Acknowledges a successful `Identify`, echoing the resolved user id.
    Identified {
        /// The internal id the credential resolved to.
        user_id: UserId,
    },

    /// A newly persisted message for a chat room this connection is in.
    ///
    /// Never delivered to connections bound to the message's sender; the
    /// sender learns of the persisted message from the HTTP response.
    MessageReceived {
        /// The chat the message was appended to.
        chat_id: ChatId,
        /// The persisted message.
        message: Message,
    },

    /// Activity notice for a chat this connection has not joined.
    ///
    /// Delivered to a participant's personal room so conversation-list
    /// unread indicators and previews stay fresh without the full message
    /// payload.
    ChatActivity {
        /// The chat that received a message.
        chat_id: ChatId,
        /// Preview text of the new message.
        preview: String,
        /// The message author.
        from: UserId,
        /// Server-side creation time of the message, so conversation
        /// lists sort on server clocks rather than the receiver's.
        timestamp: Timestamp,
    },

    /// The hub rejected an event.
    Error {
        /// Human-readable description.
        reason: String,
    },
}
