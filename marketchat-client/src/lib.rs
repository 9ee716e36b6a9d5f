//! Client-side conversation state for the MarketChat messaging subsystem.
//!
//! This crate keeps a local mirror of a user's conversations and reconciles
//! it against the server:
//!
//! - [`api::ChatApi`] is the seam to the request/response backend. The
//!   integration tests drive it with an in-process adapter over the server
//!   crate; a deployment wires it to the real HTTP surface.
//! - [`view::ChatView`] holds the pure reconciliation state: the conversation
//!   list, the currently open chat, and optimistic outgoing entries that get
//!   replaced in place once the server confirms them.
//! - [`session::ChatSession`] orchestrates the two, plus a [`realtime::RoomLink`]
//!   for room joins and same-user broadcast hints.
//! - [`realtime::RealtimeClient`] is the WebSocket implementation of the
//!   realtime side: identify, join rooms, and stream pushed server events.

pub mod api;
pub mod realtime;
pub mod session;
pub mod view;

pub use api::{ApiError, ChatApi};
pub use realtime::{RealtimeClient, RealtimeError, RoomLink};
pub use session::ChatSession;
pub use view::{ChatView, ConversationSummary, LocalId, OutgoingStatus, ViewEntry};
