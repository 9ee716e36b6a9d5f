//! Conversation service: orchestration over the store, directory, and hub.
//!
//! Every operation is keyed by a bearer credential rather than an
//! internal id — the service resolves identity first, then delegates to
//! the store. Transient store failures are retried with bounded backoff;
//! client errors pass through verbatim. After a successful append the new
//! message is handed to the realtime hub, which is strictly best-effort
//! and can never fail or delay the persisted send. Append and publish run
//! under a per-chat sequencer so room delivery follows persistence order
//! even with concurrent senders.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use marketchat_proto::ids::{ChatId, UserId};
use marketchat_proto::model::{Chat, MessageDraft};

use crate::directory::UserDirectory;
use crate::hub::RealtimeHub;
use crate::store::{ConversationStore, StoreError};

/// Errors surfaced by the conversation service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The bearer credential did not resolve to a known user.
    #[error("unknown credential")]
    Unauthorized,
    /// A store operation failed (after retries, for transient failures).
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How often and how patiently transient store failures are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    pub retries: u32,
    /// Delay between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Orchestrates conversation operations for authenticated callers.
///
/// Holds no state of its own beyond its collaborators.
pub struct ChatService {
    directory: Arc<UserDirectory>,
    store: Arc<ConversationStore>,
    hub: Arc<RealtimeHub>,
    retry: RetryPolicy,
    /// One sequencer per chat; held across append + publish so fanout
    /// order matches persistence order.
    send_locks: tokio::sync::Mutex<HashMap<ChatId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChatService {
    /// Creates a service with the default retry policy.
    #[must_use]
    pub fn new(
        directory: Arc<UserDirectory>,
        store: Arc<ConversationStore>,
        hub: Arc<RealtimeHub>,
    ) -> Self {
        Self::with_retry(directory, store, hub, RetryPolicy::default())
    }

    /// Creates a service with a custom retry policy.
    #[must_use]
    pub fn with_retry(
        directory: Arc<UserDirectory>,
        store: Arc<ConversationStore>,
        hub: Arc<RealtimeHub>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            directory,
            store,
            hub,
            retry,
            send_locks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Resolves a bearer credential to an internal user id.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Unauthorized`] for unknown credentials.
    pub async fn authenticate(&self, token: &str) -> Result<UserId, ServiceError> {
        self.directory
            .resolve(token)
            .await
            .ok_or(ServiceError::Unauthorized)
    }

    /// Runs a store operation, retrying transient failures with backoff.
    async fn with_retry_policy<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < self.retry.retries => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        max = self.retry.retries,
                        "transient store failure, retrying"
                    );
                    tokio::time::sleep(self.retry.backoff).await;
                }
                other => return other,
            }
        }
    }

    /// Lists the caller's chats, most recently active first.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Unauthorized`] or a store error.
    pub async fn list_chats(&self, token: &str) -> Result<Vec<Chat>, ServiceError> {
        let user = self.authenticate(token).await?;
        Ok(self
            .with_retry_policy(|| self.store.chats_for_user(user))
            .await?)
    }

    /// Gets or creates the chat between the caller and `recipient`.
    ///
    /// A lost first-contact race ([`StoreError::Conflict`]) is resolved
    /// here by re-fetching the winner's chat.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Unauthorized`] or a store error.
    pub async fn open_chat(&self, token: &str, recipient: UserId) -> Result<Chat, ServiceError> {
        let user = self.authenticate(token).await?;
        match self
            .with_retry_policy(|| self.store.get_or_create(user, recipient))
            .await
        {
            Err(StoreError::Conflict) => Ok(self
                .with_retry_policy(|| self.store.get_or_create(user, recipient))
                .await?),
            other => Ok(other?),
        }
    }

    /// Fetches a single chat the caller participates in.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Unauthorized`] or a store error.
    pub async fn get_chat(&self, token: &str, chat_id: ChatId) -> Result<Chat, ServiceError> {
        let user = self.authenticate(token).await?;
        Ok(self
            .with_retry_policy(|| self.store.get_chat(chat_id, user))
            .await?)
    }

    /// Persists a message and fans it out to the chat room.
    ///
    /// Returns the updated chat; the new message is its last element.
    /// Publication is best-effort and happens only after the append has
    /// durably succeeded. Append and publish are held together under the
    /// chat's sequencer, so a room member always receives messages in the
    /// order the store persisted them, even with concurrent senders. The
    /// hub never blocks on a socket, so the sequencer is only held for
    /// channel pushes.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Unauthorized`] or a store error; fanout
    /// failures are never surfaced.
    pub async fn send_message(
        &self,
        token: &str,
        chat_id: ChatId,
        draft: &MessageDraft,
    ) -> Result<Chat, ServiceError> {
        let user = self.authenticate(token).await?;

        let sequencer = {
            let mut locks = self.send_locks.lock().await;
            Arc::clone(locks.entry(chat_id).or_default())
        };
        let _ordered = sequencer.lock().await;

        let (chat, message) = self
            .with_retry_policy(|| self.store.append_message(chat_id, user, draft))
            .await?;

        let participants: Vec<UserId> = chat.participants.iter().map(|p| p.id).collect();
        self.hub.publish(chat_id, &participants, &message).await;
        Ok(chat)
    }

    /// Marks every message in the chat read for the caller.
    ///
    /// Idempotent; returns whether any message changed.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Unauthorized`] or a store error.
    pub async fn mark_read(&self, token: &str, chat_id: ChatId) -> Result<bool, ServiceError> {
        let user = self.authenticate(token).await?;
        Ok(self
            .with_retry_policy(|| self.store.mark_read(chat_id, user))
            .await?)
    }

    /// Sums unread messages for the caller across all their chats.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Unauthorized`] or a store error.
    pub async fn unread_count(&self, token: &str) -> Result<u64, ServiceError> {
        let user = self.authenticate(token).await?;
        Ok(self
            .with_retry_policy(|| self.store.unread_count(user))
            .await?)
    }

}
