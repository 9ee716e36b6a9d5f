//! Orchestration between the view state, the backend API, and the hub.
//!
//! [`ChatSession`] owns a [`ChatView`] behind a `parking_lot` mutex and
//! drives it from three directions: explicit user actions (refresh,
//! select, send), API responses, and realtime [`ServerEvent`]s drained
//! by the embedding application. The view lock is never held across an
//! await point; every API call brackets its own short lock section.

use parking_lot::Mutex;

use marketchat_proto::events::ServerEvent;
use marketchat_proto::ids::{ChatId, UserId};
use marketchat_proto::model::{Chat, Message, MessageDraft};

use crate::api::{ApiError, ChatApi};
use crate::realtime::RoomLink;
use crate::view::{ChatView, ConversationSummary, LocalId, ViewEntry};

/// Errors from session-level operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A send was attempted with no chat open.
    #[error("no chat is open")]
    NoOpenChat,

    /// The backend accepted a send but returned a chat with no messages.
    #[error("backend returned no confirmed message")]
    MissingConfirmation,

    /// The backend call failed.
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// A user's live messaging session.
pub struct ChatSession<A: ChatApi, R: RoomLink> {
    api: A,
    link: R,
    view: Mutex<ChatView>,
}

impl<A: ChatApi, R: RoomLink> ChatSession<A, R> {
    /// Create a session for the given local user.
    pub fn new(api: A, link: R, me: UserId) -> Self {
        Self {
            api,
            link,
            view: Mutex::new(ChatView::new(me)),
        }
    }

    /// Reload the conversation list from the backend.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Api`] when the roster fetch fails.
    pub async fn refresh(&self) -> Result<(), SessionError> {
        let chats = self.api.list_chats().await?;
        self.view.lock().load_conversations(&chats);
        Ok(())
    }

    /// Open (or create) the conversation with `recipient` and select it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Api`] when the backend rejects the pair.
    pub async fn open_with(&self, recipient: UserId) -> Result<ChatId, SessionError> {
        let chat = self.api.open_chat(recipient).await?;
        let chat_id = chat.id;
        self.activate(chat).await;
        Ok(chat_id)
    }

    /// Select an existing chat, fetching its full history.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Api`] when the fetch fails.
    pub async fn select_chat(&self, chat_id: ChatId) -> Result<(), SessionError> {
        let chat = self.api.get_chat(chat_id).await?;
        self.activate(chat).await;
        Ok(())
    }

    /// Seed the view from a chat snapshot, join its room, and mark it read.
    ///
    /// Room join and mark-read are best effort: losing realtime or a
    /// receipt update must not take down a successfully opened chat.
    async fn activate(&self, chat: Chat) {
        let chat_id = chat.id;
        self.view.lock().select(&chat);

        if let Err(err) = self.link.join_room(chat_id).await {
            tracing::warn!(chat = %chat_id, error = %err, "room join failed");
        }
        if let Err(err) = self.api.mark_read(chat_id).await {
            tracing::warn!(chat = %chat_id, error = %err, "mark read failed");
        }
    }

    /// Send a message in the open chat, optimistically.
    ///
    /// The draft appears in the view immediately; the server's confirmed
    /// message replaces it in place once the call returns. On failure the
    /// entry flips to `Failed` and stays visible for [`resend`](Self::resend).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoOpenChat`] when nothing is selected, or
    /// the backend error that failed the send.
    pub async fn send(&self, draft: MessageDraft) -> Result<Message, SessionError> {
        let draft = draft.normalized();
        let (chat_id, local_id) = {
            let mut view = self.view.lock();
            let chat_id = view.open_chat().ok_or(SessionError::NoOpenChat)?;
            let local_id = view
                .optimistic_send(draft.clone())
                .ok_or(SessionError::NoOpenChat)?;
            (chat_id, local_id)
        };
        self.deliver(chat_id, local_id, &draft).await
    }

    /// Resend a failed entry, reusing its original draft.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoOpenChat`] when the entry is gone or not
    /// in the failed state, or the backend error that failed the resend.
    pub async fn resend(&self, local_id: LocalId) -> Result<Message, SessionError> {
        let (chat_id, local_id, draft) = {
            let mut view = self.view.lock();
            let chat_id = view.open_chat().ok_or(SessionError::NoOpenChat)?;
            let draft = view
                .take_failed(chat_id, local_id)
                .ok_or(SessionError::NoOpenChat)?;
            let local_id = view
                .optimistic_send(draft.clone())
                .ok_or(SessionError::NoOpenChat)?;
            (chat_id, local_id, draft)
        };
        self.deliver(chat_id, local_id, &draft).await
    }

    /// Run the backend call for an already-queued optimistic entry.
    ///
    /// A single retryable blip (network failure, transient backend error)
    /// is absorbed with one immediate retry; only the second failure
    /// flips the entry to `Failed`.
    async fn deliver(
        &self,
        chat_id: ChatId,
        local_id: LocalId,
        draft: &MessageDraft,
    ) -> Result<Message, SessionError> {
        let result = match self.api.send_message(chat_id, draft).await {
            Err(err) if err.is_retryable() => {
                tracing::warn!(chat = %chat_id, error = %err, "send failed, retrying once");
                self.api.send_message(chat_id, draft).await
            }
            other => other,
        };
        match result {
            Ok(chat) => {
                let Some(message) = chat.messages.last().cloned() else {
                    self.view.lock().fail(chat_id, local_id);
                    return Err(SessionError::MissingConfirmation);
                };
                self.view.lock().confirm(chat_id, local_id, message.clone());

                // Let this user's other tabs see the message too.
                if let Err(err) = self.link.broadcast_hint(chat_id, &message).await {
                    tracing::debug!(chat = %chat_id, error = %err, "broadcast hint failed");
                }
                Ok(message)
            }
            Err(err) => {
                tracing::warn!(chat = %chat_id, error = %err, "send failed");
                self.view.lock().fail(chat_id, local_id);
                Err(err.into())
            }
        }
    }

    /// Apply one realtime event to the view.
    pub fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::MessageReceived { chat_id, message } => {
                self.view.lock().apply_push(chat_id, &message);
            }
            ServerEvent::ChatActivity {
                chat_id,
                preview,
                timestamp,
                ..
            } => {
                self.view.lock().apply_activity(chat_id, &preview, timestamp);
            }
            ServerEvent::Identified { user_id } => {
                tracing::debug!(user = %user_id, "identity confirmed");
            }
            ServerEvent::Error { reason } => {
                tracing::warn!(reason = %reason, "realtime error event");
            }
        }
    }

    /// Snapshot of the conversation list.
    #[must_use]
    pub fn conversations(&self) -> Vec<ConversationSummary> {
        self.view.lock().conversations().to_vec()
    }

    /// Snapshot of the open chat's visible entries.
    #[must_use]
    pub fn visible(&self) -> Vec<ViewEntry> {
        self.view.lock().visible().to_vec()
    }

    /// The open chat, if any.
    #[must_use]
    pub fn open_chat(&self) -> Option<ChatId> {
        self.view.lock().open_chat()
    }

    /// Sum of unread badges across the conversation list.
    #[must_use]
    pub fn unread_total(&self) -> u64 {
        self.view.lock().unread_total()
    }
}
