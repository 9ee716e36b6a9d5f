//! Pure reconciliation state for the conversation UI.
//!
//! [`ChatView`] mirrors what the user sees: the conversation list with
//! previews and unread badges, and the currently open chat's message list.
//! Sends are optimistic — an [`OutgoingEntry`] appears immediately with a
//! [`LocalId`], and the server's confirmation later replaces it *in place*
//! keyed by that id, never appended a second time. Pushed messages merge
//! by server [`MessageId`], so a message that arrives both as a send
//! confirmation and as a realtime push shows up exactly once.
//!
//! # Ordering invariant
//!
//! The visible entry list is always a run of confirmed messages (server
//! order) followed by a run of outgoing entries (local send order).
//! Confirmations and pushes insert at the end of the confirmed run, so
//! pending entries trail the conversation until resolved.

use std::collections::HashSet;
use std::fmt;

use uuid::Uuid;

use marketchat_proto::ids::{ChatId, MessageId, Timestamp, UserId};
use marketchat_proto::model::{Chat, Message, MessageDraft, UserProfile};

/// Client-local identity for an optimistic entry, minted before the server
/// has assigned a [`MessageId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalId(Uuid);

impl LocalId {
    /// Mint a fresh local id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

/// Delivery state of an optimistic entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingStatus {
    /// The send request is in flight.
    Sending,
    /// The send request failed; the entry stays visible so the user can
    /// retry or discard it.
    Failed,
}

/// An optimistic entry awaiting server confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEntry {
    /// Client-local identity, the key the confirmation replaces by.
    pub local_id: LocalId,
    /// The draft as the user submitted it.
    pub draft: MessageDraft,
    /// Current delivery state.
    pub status: OutgoingStatus,
    /// When the entry was queued locally.
    pub queued_at: Timestamp,
}

/// One entry in the open chat's visible message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEntry {
    /// A server-confirmed message.
    Confirmed(Message),
    /// An optimistic entry still owned by the client.
    Outgoing(OutgoingEntry),
}

impl ViewEntry {
    /// Whether this entry is still awaiting (or has failed) confirmation.
    #[must_use]
    pub const fn is_outgoing(&self) -> bool {
        matches!(self, Self::Outgoing(_))
    }
}

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    /// The chat this row represents.
    pub chat_id: ChatId,
    /// The other participant, if the roster included their profile.
    pub other: Option<UserProfile>,
    /// Preview of the latest message.
    pub preview: Option<String>,
    /// Messages not yet read by the local user.
    pub unread: u64,
    /// Last activity, for sort order.
    pub updated_at: Timestamp,
}

/// The currently open chat.
#[derive(Debug)]
struct OpenConversation {
    chat_id: ChatId,
    entries: Vec<ViewEntry>,
    /// Server ids already present in `entries`, for duplicate suppression.
    seen: HashSet<MessageId>,
}

impl OpenConversation {
    /// Index of the first outgoing entry, i.e. the end of the confirmed run.
    fn confirmed_end(&self) -> usize {
        self.entries
            .iter()
            .position(ViewEntry::is_outgoing)
            .unwrap_or(self.entries.len())
    }

    /// Insert a confirmed message at the end of the confirmed run,
    /// dropping it if the id was already merged.
    fn merge_confirmed(&mut self, message: Message) -> bool {
        if !self.seen.insert(message.id) {
            return false;
        }
        let at = self.confirmed_end();
        self.entries.insert(at, ViewEntry::Confirmed(message));
        true
    }
}

/// Client-side mirror of the user's conversations.
///
/// Purely synchronous state; [`crate::session::ChatSession`] drives it from
/// API responses and realtime events.
#[derive(Debug)]
pub struct ChatView {
    me: UserId,
    conversations: Vec<ConversationSummary>,
    open: Option<OpenConversation>,
}

impl ChatView {
    /// Create an empty view for the given local user.
    #[must_use]
    pub const fn new(me: UserId) -> Self {
        Self {
            me,
            conversations: Vec::new(),
            open: None,
        }
    }

    /// The local user this view belongs to.
    #[must_use]
    pub const fn me(&self) -> UserId {
        self.me
    }

    /// The conversation list, most recently active first.
    #[must_use]
    pub fn conversations(&self) -> &[ConversationSummary] {
        &self.conversations
    }

    /// The open chat's visible entries, or an empty slice if none is open.
    #[must_use]
    pub fn visible(&self) -> &[ViewEntry] {
        self.open.as_ref().map_or(&[], |open| &open.entries)
    }

    /// The currently open chat, if any.
    #[must_use]
    pub fn open_chat(&self) -> Option<ChatId> {
        self.open.as_ref().map(|open| open.chat_id)
    }

    /// Sum of unread badges across the conversation list.
    #[must_use]
    pub fn unread_total(&self) -> u64 {
        self.conversations.iter().map(|c| c.unread).sum()
    }

    /// Replace the conversation list from a fresh server roster.
    ///
    /// Keeps the open chat (if any) untouched; only the list is rebuilt.
    pub fn load_conversations(&mut self, chats: &[Chat]) {
        self.conversations = chats.iter().map(|chat| self.summarize(chat)).collect();
        self.sort_conversations();
    }

    /// Open a chat, replacing any previously open one.
    ///
    /// The entry list is seeded from the server's history and the row's
    /// unread badge is cleared locally (the session issues the matching
    /// `mark_read` call).
    pub fn select(&mut self, chat: &Chat) {
        let seen: HashSet<MessageId> = chat.messages.iter().map(|m| m.id).collect();
        let entries = chat
            .messages
            .iter()
            .cloned()
            .map(ViewEntry::Confirmed)
            .collect();
        self.open = Some(OpenConversation {
            chat_id: chat.id,
            entries,
            seen,
        });

        self.upsert_summary(chat);
        if let Some(row) = self.row_mut(chat.id) {
            row.unread = 0;
        }
    }

    /// Close the open chat, if any.
    pub fn close(&mut self) {
        self.open = None;
    }

    /// Queue an optimistic entry in the open chat and return its id.
    ///
    /// Returns `None` when no chat is open; the caller has nothing to
    /// attach the draft to.
    pub fn optimistic_send(&mut self, draft: MessageDraft) -> Option<LocalId> {
        let open = self.open.as_mut()?;
        let local_id = LocalId::new();
        open.entries.push(ViewEntry::Outgoing(OutgoingEntry {
            local_id,
            draft,
            status: OutgoingStatus::Sending,
            queued_at: Timestamp::now(),
        }));
        Some(local_id)
    }

    /// Resolve an optimistic entry with the server's confirmed message.
    ///
    /// The outgoing entry is removed and the confirmed message takes its
    /// place at the end of the confirmed run. If the local id is gone
    /// (the chat was reopened meanwhile) the message still merges by
    /// server id. Returns whether the visible list changed.
    pub fn confirm(&mut self, chat_id: ChatId, local_id: LocalId, message: Message) -> bool {
        self.touch_summary(chat_id, message.preview().to_string(), message.timestamp, false);

        let Some(open) = self.open.as_mut() else {
            return false;
        };
        if open.chat_id != chat_id {
            return false;
        }

        open.entries.retain(|entry| {
            !matches!(entry, ViewEntry::Outgoing(out) if out.local_id == local_id)
        });
        open.merge_confirmed(message)
    }

    /// Mark an optimistic entry as failed, keeping it visible.
    pub fn fail(&mut self, chat_id: ChatId, local_id: LocalId) {
        let Some(open) = self.open.as_mut() else {
            return;
        };
        if open.chat_id != chat_id {
            return;
        }
        for entry in &mut open.entries {
            if let ViewEntry::Outgoing(out) = entry
                && out.local_id == local_id
            {
                out.status = OutgoingStatus::Failed;
            }
        }
    }

    /// Drop a failed optimistic entry and hand its draft back for resend.
    pub fn take_failed(&mut self, chat_id: ChatId, local_id: LocalId) -> Option<MessageDraft> {
        let open = self.open.as_mut()?;
        if open.chat_id != chat_id {
            return None;
        }
        let at = open.entries.iter().position(|entry| {
            matches!(
                entry,
                ViewEntry::Outgoing(out)
                    if out.local_id == local_id && out.status == OutgoingStatus::Failed
            )
        })?;
        match open.entries.remove(at) {
            ViewEntry::Outgoing(out) => Some(out.draft),
            ViewEntry::Confirmed(_) => None,
        }
    }

    /// Apply a realtime push of a new message.
    ///
    /// Merges into the open chat when it matches (duplicates dropped by
    /// id), and updates the conversation row either way. The unread badge
    /// only grows for chats the user does not have open.
    pub fn apply_push(&mut self, chat_id: ChatId, message: &Message) -> bool {
        let is_open = self.open_chat() == Some(chat_id);
        self.touch_summary(chat_id, message.preview().to_string(), message.timestamp, !is_open);

        if !is_open {
            return false;
        }
        let Some(open) = self.open.as_mut() else {
            return false;
        };
        open.merge_confirmed(message.clone())
    }

    /// Apply an activity notice for a chat the user is not watching.
    ///
    /// Only bumps the row's preview and unread badge; no message body is
    /// carried. Ignored for the open chat, whose messages arrive whole.
    /// `at` is the message's server-side timestamp, so the conversation
    /// list sorts consistently regardless of local clock skew.
    pub fn apply_activity(&mut self, chat_id: ChatId, preview: &str, at: Timestamp) {
        if self.open_chat() == Some(chat_id) {
            return;
        }
        self.touch_summary(chat_id, preview.to_string(), at, true);
    }

    fn summarize(&self, chat: &Chat) -> ConversationSummary {
        ConversationSummary {
            chat_id: chat.id,
            other: chat.other_participant(self.me).cloned(),
            preview: chat.last_message.clone(),
            unread: chat.unread_for(self.me),
            updated_at: chat.updated_at,
        }
    }

    /// Insert or refresh the row for `chat` from a full server snapshot.
    fn upsert_summary(&mut self, chat: &Chat) {
        let summary = self.summarize(chat);
        if let Some(row) = self.row_mut(chat.id) {
            *row = summary;
        } else {
            self.conversations.push(summary);
        }
        self.sort_conversations();
    }

    /// Bump a row's preview and activity time, optionally its unread badge.
    ///
    /// Rows for chats the roster has not loaded yet are created on the
    /// fly so first-contact pushes are not lost.
    fn touch_summary(&mut self, chat_id: ChatId, preview: String, at: Timestamp, bump_unread: bool) {
        if let Some(row) = self.row_mut(chat_id) {
            row.preview = Some(preview);
            row.updated_at = at;
            if bump_unread {
                row.unread += 1;
            }
        } else {
            self.conversations.push(ConversationSummary {
                chat_id,
                other: None,
                preview: Some(preview),
                unread: u64::from(bump_unread),
                updated_at: at,
            });
        }
        self.sort_conversations();
    }

    fn row_mut(&mut self, chat_id: ChatId) -> Option<&mut ConversationSummary> {
        self.conversations.iter_mut().find(|c| c.chat_id == chat_id)
    }

    fn sort_conversations(&mut self) {
        self.conversations.sort_by(|a, b| {
            b.updated_at
                .as_millis()
                .cmp(&a.updated_at.as_millis())
                .then_with(|| b.chat_id.as_uuid().cmp(&a.chat_id.as_uuid()))
        });
    }
}
