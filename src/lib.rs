//! Rust client for the Pushover Open Client API.
//!
//! The crate is organized by concern:
//! - `client`: consumer-facing client with the delivery queue.
//! - `session`: login and device registration state.
//! - `api`: HTTP client for login, registration, fetch and acknowledge.
//! - `message`: message type and its wire encoding.
//! - `sync`: fetch, deliver and acknowledge as one unit.
//! - `stream`: realtime websocket notifications.
//! - `retry`: bounded reconnect policy.

/// HTTP API client and reply types.
pub mod api;
/// Consumer-facing client.
pub mod client;
/// Messages returned by the message store.
pub mod message;
/// Reconnect policy used by the notification stream.
pub mod retry;
/// Login and device registration state.
pub mod session;
/// Realtime notification stream.
pub mod stream;
/// Message synchronization.
pub mod sync;

pub use client::{Client, ClientOptions, Deliveries};
pub use message::Message;
pub use stream::client::{StreamError, StreamState};
