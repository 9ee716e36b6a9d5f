//! Postcard serialization for realtime channel frames.
//!
//! WebSocket binary messages preserve frame boundaries, so no additional
//! length-prefix framing is needed — each frame holds exactly one encoded
//! event.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Encodes an event into a byte vector using postcard.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes an event from a byte slice using postcard.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the bytes cannot be
/// deserialized into `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}
