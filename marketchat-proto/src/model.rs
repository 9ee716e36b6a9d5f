//! Domain model for chats and messages.
//!
//! A [`Chat`] is a two-party conversation aggregate embedding its ordered
//! message sequence, mirroring how the store persists it: every mutation
//! (append, mark-read) is applied to the aggregate as a whole.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::{ChatId, MessageId, Timestamp, UserId};

/// Default maximum message content length in bytes (16 KiB).
pub const MAX_CONTENT_LEN: usize = 16 * 1024;

/// Conversation-list preview text used for messages that carry only an image.
pub const IMAGE_PREVIEW: &str = "[image]";

/// Display metadata for a chat participant.
///
/// Owned by the user directory; the messaging core only reads it and
/// attaches it to chats so clients can render names and avatars without a
/// second lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Internal user identifier.
    pub id: UserId,
    /// Display name.
    pub name: String,
    /// Avatar image URL, if the user has one.
    pub avatar_url: Option<String>,
}

/// A single chat turn.
///
/// Immutable after creation except for `read_by`, which grows
/// monotonically — a read is never undone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned identifier, unique within the chat.
    pub id: MessageId,
    /// Author; always one of the chat's two participants.
    pub sender_id: UserId,
    /// Text content. May be absent only when `image` is present.
    pub content: Option<String>,
    /// URL of an already-uploaded image. May be absent only when `content`
    /// is present.
    pub image: Option<String>,
    /// Users who have seen this message. The sender is a member from
    /// creation.
    pub read_by: BTreeSet<UserId>,
    /// Server-side creation time.
    pub timestamp: Timestamp,
}

impl Message {
    /// Returns the text shown in conversation-list previews: the content,
    /// or a placeholder when the message is image-only.
    #[must_use]
    pub fn preview(&self) -> &str {
        self.content.as_deref().unwrap_or(IMAGE_PREVIEW)
    }

    /// Returns `true` if `user` has not seen this message.
    #[must_use]
    pub fn is_unread_by(&self, user: UserId) -> bool {
        !self.read_by.contains(&user)
    }
}

/// A two-party conversation aggregate.
///
/// Created on first contact between a pair of users and never deleted.
/// `participants` always holds exactly two distinct users, and at most one
/// chat exists per unordered pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    /// Opaque unique identifier assigned at creation.
    pub id: ChatId,
    /// Exactly two distinct participants, with profile data attached.
    pub participants: Vec<UserProfile>,
    /// Ordered message sequence; ordering is server receipt order.
    pub messages: Vec<Message>,
    /// Denormalized preview of the most recent message.
    pub last_message: Option<String>,
    /// Time of the last message append. Mark-read does not advance this.
    pub updated_at: Timestamp,
}

impl Chat {
    /// Returns `true` if `user` is one of the two participants.
    #[must_use]
    pub fn has_participant(&self, user: UserId) -> bool {
        self.participants.iter().any(|p| p.id == user)
    }

    /// Returns the participant other than `user`, if `user` is a member.
    #[must_use]
    pub fn other_participant(&self, user: UserId) -> Option<&UserProfile> {
        if !self.has_participant(user) {
            return None;
        }
        self.participants.iter().find(|p| p.id != user)
    }

    /// Counts messages in this chat that `user` has not read.
    #[must_use]
    pub fn unread_for(&self, user: UserId) -> u64 {
        self.messages
            .iter()
            .filter(|m| m.is_unread_by(user))
            .count() as u64
    }
}

/// Validation failures for an outgoing message draft.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Both content and image were empty or absent.
    #[error("message must carry text content or an image")]
    Empty,
    /// Content exceeded the configured size limit.
    #[error("content too long: {len} bytes (max {max})")]
    TooLong {
        /// Actual content length in bytes.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },
}

/// An outgoing message before the server has accepted it.
///
/// Blank or whitespace-only fields are treated as absent, so a draft built
/// from raw form input normalizes to the same shape the store persists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    /// Text content, if any.
    pub content: Option<String>,
    /// Image URL, if any.
    pub image: Option<String>,
}

impl MessageDraft {
    /// Creates a text-only draft.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            image: None,
        }
    }

    /// Creates an image-only draft.
    #[must_use]
    pub fn image(url: impl Into<String>) -> Self {
        Self {
            content: None,
            image: Some(url.into()),
        }
    }

    /// Normalizes the draft, mapping empty or whitespace-only fields to
    /// `None`.
    #[must_use]
    pub fn normalized(&self) -> Self {
        let clean = |field: &Option<String>| {
            field
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            content: clean(&self.content),
            image: clean(&self.image),
        }
    }

    /// Validates the non-empty rule and the content length cap.
    ///
    /// Call on a [`normalized`](Self::normalized) draft; a draft whose
    /// fields are both absent (or blank) fails with
    /// [`ValidationError::Empty`].
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] or [`ValidationError::TooLong`].
    pub fn validate(&self, max_content_len: usize) -> Result<(), ValidationError> {
        let normalized = self.normalized();
        if normalized.content.is_none() && normalized.image.is_none() {
            return Err(ValidationError::Empty);
        }
        if let Some(content) = &normalized.content
            && content.len() > max_content_len
        {
            return Err(ValidationError::TooLong {
                len: content.len(),
                max: max_content_len,
            });
        }
        Ok(())
    }
}
