//! Conversation store: durable-style operations on the Chat aggregate.
//!
//! Chats are embedded aggregates — a chat owns its ordered message
//! sequence, and every mutation (append one message, mark all read) is
//! applied atomically under a single write lock so concurrent requests
//! touching the same chat never lose updates. A canonicalized
//! participant-pair index enforces that at most one chat exists per
//! unordered user pair; first-contact races resolve to the existing chat
//! instead of creating a duplicate.
//!
//! Lock acquisition is bounded by a timeout so a store operation fails
//! fast with a retryable error rather than hanging a request.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use marketchat_proto::ids::{ChatId, MessageId, Timestamp, UserId};
use marketchat_proto::model::{Chat, Message, MessageDraft, ValidationError};
use tokio::sync::RwLock;

use crate::directory::UserDirectory;

/// Default bound on how long a store operation may wait for the aggregate
/// lock before surfacing a retryable error.
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur during conversation store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The chat does not exist.
    #[error("chat not found")]
    ChatNotFound,
    /// A referenced user does not exist in the directory.
    #[error("user not found")]
    UserNotFound,
    /// The actor is not a participant of the chat.
    #[error("not a participant of this chat")]
    Forbidden,
    /// The message failed content validation.
    #[error(transparent)]
    InvalidMessage(#[from] ValidationError),
    /// A chat requires two distinct participants.
    #[error("a chat requires two distinct participants")]
    InvalidParticipants,
    /// A concurrent creator won the participant-pair uniqueness race.
    ///
    /// Not produced by the in-memory store, whose pair index is updated
    /// under the same lock as the lookup; reserved for storage backends
    /// that enforce the constraint out of process. Callers resolve it by
    /// re-fetching the winner's chat.
    #[error("chat already exists for this participant pair")]
    Conflict,
    /// The operation could not acquire storage within the time bound.
    #[error("storage operation timed out")]
    Transient,
}

impl StoreError {
    /// Returns `true` if the operation is safe to retry with backoff.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Canonicalized unordered participant pair, used as the uniqueness key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PairKey(UserId, UserId);

impl PairKey {
    fn new(a: UserId, b: UserId) -> Self {
        if a <= b { Self(a, b) } else { Self(b, a) }
    }
}

/// A chat aggregate as persisted: participant ids only, profiles are
/// attached at read time.
#[derive(Debug, Clone)]
struct ChatRecord {
    id: ChatId,
    participants: [UserId; 2],
    messages: Vec<Message>,
    last_message: Option<String>,
    updated_at: Timestamp,
}

impl ChatRecord {
    fn has_participant(&self, user: UserId) -> bool {
        self.participants.contains(&user)
    }

    fn unread_for(&self, user: UserId) -> u64 {
        self.messages
            .iter()
            .filter(|m| m.is_unread_by(user))
            .count() as u64
    }
}

#[derive(Default)]
struct StoreInner {
    chats: HashMap<ChatId, ChatRecord>,
    by_pair: HashMap<PairKey, ChatId>,
}

/// In-memory conversation store with participant-pair deduplication.
///
/// Thread-safe via [`RwLock`]; cross-chat reads (listing, unread
/// aggregation) take the read half, aggregate mutations take the write
/// half.
pub struct ConversationStore {
    directory: Arc<UserDirectory>,
    inner: RwLock<StoreInner>,
    max_content_len: usize,
    op_timeout: Duration,
}

impl ConversationStore {
    /// Creates a store with default limits.
    #[must_use]
    pub fn new(directory: Arc<UserDirectory>) -> Self {
        Self::with_limits(
            directory,
            marketchat_proto::model::MAX_CONTENT_LEN,
            DEFAULT_OP_TIMEOUT,
        )
    }

    /// Creates a store with a custom content length cap and lock timeout.
    #[must_use]
    pub fn with_limits(
        directory: Arc<UserDirectory>,
        max_content_len: usize,
        op_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            inner: RwLock::new(StoreInner::default()),
            max_content_len,
            op_timeout,
        }
    }

    /// Acquires the write half of the aggregate lock within the time bound.
    async fn write_inner(
        &self,
    ) -> Result<tokio::sync::RwLockWriteGuard<'_, StoreInner>, StoreError> {
        tokio::time::timeout(self.op_timeout, self.inner.write())
            .await
            .map_err(|_| StoreError::Transient)
    }

    /// Acquires the read half of the aggregate lock within the time bound.
    async fn read_inner(
        &self,
    ) -> Result<tokio::sync::RwLockReadGuard<'_, StoreInner>, StoreError> {
        tokio::time::timeout(self.op_timeout, self.inner.read())
            .await
            .map_err(|_| StoreError::Transient)
    }

    /// Attaches participant profiles to a raw chat record.
    async fn attach(&self, record: ChatRecord) -> Chat {
        let participants = self.directory.profiles(&record.participants).await;
        Chat {
            id: record.id,
            participants,
            messages: record.messages,
            last_message: record.last_message,
            updated_at: record.updated_at,
        }
    }

    /// Returns the chat for the unordered pair `{a, b}`, creating it with
    /// an empty message list on first contact.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidParticipants`] if `a == b`,
    /// [`StoreError::UserNotFound`] if either user is unknown, or
    /// [`StoreError::Transient`] on lock timeout.
    pub async fn get_or_create(&self, a: UserId, b: UserId) -> Result<Chat, StoreError> {
        if a == b {
            return Err(StoreError::InvalidParticipants);
        }
        if !self.directory.exists(a).await || !self.directory.exists(b).await {
            return Err(StoreError::UserNotFound);
        }

        let key = PairKey::new(a, b);
        let mut inner = self.write_inner().await?;

        if let Some(existing) = inner.by_pair.get(&key)
            && let Some(record) = inner.chats.get(existing)
        {
            let record = record.clone();
            drop(inner);
            return Ok(self.attach(record).await);
        }

        let record = ChatRecord {
            id: ChatId::new(),
            participants: [a, b],
            messages: Vec::new(),
            last_message: None,
            updated_at: Timestamp::now(),
        };
        inner.by_pair.insert(key, record.id);
        inner.chats.insert(record.id, record.clone());
        drop(inner);

        tracing::info!(chat_id = %record.id, a = %a, b = %b, "chat created");
        Ok(self.attach(record).await)
    }

    /// Appends a message to a chat as a single atomic aggregate update.
    ///
    /// Assigns the id and timestamp server-side, seeds `read_by` with the
    /// sender, and refreshes the chat's preview and `updated_at`. Returns
    /// the updated chat together with the persisted message.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ChatNotFound`], [`StoreError::Forbidden`] if
    /// the sender is not a participant, [`StoreError::InvalidMessage`] if
    /// both content and image are empty, or [`StoreError::Transient`] on
    /// lock timeout.
    pub async fn append_message(
        &self,
        chat_id: ChatId,
        sender: UserId,
        draft: &MessageDraft,
    ) -> Result<(Chat, Message), StoreError> {
        draft.validate(self.max_content_len)?;
        let normalized = draft.normalized();

        let mut inner = self.write_inner().await?;
        let record = inner.chats.get_mut(&chat_id).ok_or(StoreError::ChatNotFound)?;
        if !record.has_participant(sender) {
            return Err(StoreError::Forbidden);
        }

        let message = Message {
            id: MessageId::new(),
            sender_id: sender,
            content: normalized.content,
            image: normalized.image,
            read_by: BTreeSet::from([sender]),
            timestamp: Timestamp::now(),
        };
        record.last_message = Some(message.preview().to_string());
        record.updated_at = message.timestamp;
        record.messages.push(message.clone());
        let record = record.clone();
        drop(inner);

        tracing::debug!(
            chat_id = %chat_id,
            message_id = %message.id,
            sender = %sender,
            "message appended"
        );
        Ok((self.attach(record).await, message))
    }

    /// Adds `user` to the `read_by` set of every message in the chat that
    /// does not contain it yet.
    ///
    /// Idempotent; returns `true` if any message changed. Does not advance
    /// `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ChatNotFound`], [`StoreError::Forbidden`] if
    /// `user` is not a participant, or [`StoreError::Transient`] on lock
    /// timeout.
    pub async fn mark_read(&self, chat_id: ChatId, user: UserId) -> Result<bool, StoreError> {
        let mut inner = self.write_inner().await?;
        let record = inner.chats.get_mut(&chat_id).ok_or(StoreError::ChatNotFound)?;
        if !record.has_participant(user) {
            return Err(StoreError::Forbidden);
        }

        let mut changed = false;
        for message in &mut record.messages {
            changed |= message.read_by.insert(user);
        }
        drop(inner);

        if changed {
            tracing::debug!(chat_id = %chat_id, user = %user, "chat marked read");
        }
        Ok(changed)
    }

    /// Fetches a single chat; only its participants may read it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ChatNotFound`], [`StoreError::Forbidden`], or
    /// [`StoreError::Transient`] on lock timeout.
    pub async fn get_chat(&self, chat_id: ChatId, user: UserId) -> Result<Chat, StoreError> {
        let inner = self.read_inner().await?;
        let record = inner.chats.get(&chat_id).ok_or(StoreError::ChatNotFound)?;
        if !record.has_participant(user) {
            return Err(StoreError::Forbidden);
        }
        let record = record.clone();
        drop(inner);
        Ok(self.attach(record).await)
    }

    /// Lists every chat `user` participates in, most recently active
    /// first. Ties on `updated_at` break by chat id, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transient`] on lock timeout.
    pub async fn chats_for_user(&self, user: UserId) -> Result<Vec<Chat>, StoreError> {
        let inner = self.read_inner().await?;
        let mut records: Vec<ChatRecord> = inner
            .chats
            .values()
            .filter(|r| r.has_participant(user))
            .cloned()
            .collect();
        drop(inner);

        records.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        let mut chats = Vec::with_capacity(records.len());
        for record in records {
            chats.push(self.attach(record).await);
        }
        Ok(chats)
    }

    /// Sums unread messages for `user` across all their chats.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transient`] on lock timeout.
    pub async fn unread_count(&self, user: UserId) -> Result<u64, StoreError> {
        let inner = self.read_inner().await?;
        Ok(inner
            .chats
            .values()
            .filter(|r| r.has_participant(user))
            .map(|r| r.unread_for(user))
            .sum())
    }
}
