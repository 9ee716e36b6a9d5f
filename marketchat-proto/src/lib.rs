//! Shared types for the MarketChat messaging subsystem.
//!
//! Defines the domain model (chats, messages, profiles), the identifier
//! newtypes used across the HTTP and realtime surfaces, the realtime
//! event enums, and the postcard codec for WebSocket binary frames.

pub mod codec;
pub mod events;
pub mod ids;
pub mod model;
