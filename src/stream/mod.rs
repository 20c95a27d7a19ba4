//! Realtime notification stream.
//!
//! - `client`: websocket lifecycle, frame loop and reload handling.
//! - `proto`: login line and frame tokens of the notification socket.

/// Notification socket controller and its states and errors.
pub mod client;
/// Notification socket wire protocol.
pub mod proto;
