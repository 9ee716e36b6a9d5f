//! The request/response seam between the client and the chat backend.
//!
//! [`ChatApi`] mirrors the server's conversation operations one-for-one.
//! Keeping it a trait lets the reconciliation layer run against an
//! in-process backend in tests and against the real HTTP surface in a
//! deployment, without the view code knowing the difference.

use marketchat_proto::ids::{ChatId, UserId};
use marketchat_proto::model::{Chat, MessageDraft};

/// Errors surfaced by a [`ChatApi`] backend.
///
/// These mirror the server's error taxonomy so the view layer can decide
/// what a failed optimistic send should look like.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// The credential was missing or not recognized.
    #[error("unauthorized")]
    Unauthorized,

    /// The chat or user does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller is not a participant of the chat.
    #[error("forbidden")]
    Forbidden,

    /// The message draft was rejected (empty, oversized, ...).
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The backend could not complete the operation right now.
    ///
    /// Retryable; the view keeps the optimistic entry in `Failed` state
    /// so the user can resend.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// The backend could not be reached at all.
    #[error("network error: {0}")]
    Network(String),
}

impl ApiError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Network(_))
    }
}

/// The conversation operations the client needs from the backend.
///
/// Every call authenticates with the bearer token the implementation was
/// constructed with; the caller never passes identity per call.
pub trait ChatApi: Send + Sync {
    /// Fetch all of the caller's chats, most recently active first.
    fn list_chats(&self) -> impl Future<Output = Result<Vec<Chat>, ApiError>> + Send;

    /// Fetch or create the chat between the caller and `recipient`.
    fn open_chat(
        &self,
        recipient: UserId,
    ) -> impl Future<Output = Result<Chat, ApiError>> + Send;

    /// Fetch one chat with its full message history.
    fn get_chat(&self, chat_id: ChatId) -> impl Future<Output = Result<Chat, ApiError>> + Send;

    /// Append a message and return the updated chat.
    ///
    /// The confirmed message is the last entry of the returned chat's
    /// history.
    fn send_message(
        &self,
        chat_id: ChatId,
        draft: &MessageDraft,
    ) -> impl Future<Output = Result<Chat, ApiError>> + Send;

    /// Mark every message in the chat read for the caller.
    ///
    /// Returns whether anything changed.
    fn mark_read(&self, chat_id: ChatId) -> impl Future<Output = Result<bool, ApiError>> + Send;

    /// Total unread messages for the caller across all chats.
    fn unread_count(&self) -> impl Future<Output = Result<u64, ApiError>> + Send;
}
