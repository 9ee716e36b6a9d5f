//! MarketChat messaging server library.
//!
//! Exposes the conversation store, service, realtime hub, and HTTP surface
//! for use in tests and embedding. The binary entry point in `main.rs`
//! wires these together from the resolved configuration.

pub mod config;
pub mod directory;
pub mod hub;
pub mod routes;
pub mod service;
pub mod socket;
pub mod store;
