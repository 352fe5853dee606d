//! Rust client for the realtime feed event socket.
//!
//! The crate is organized by concern:
//! - `stream`: auto-reconnecting websocket client, wire codec, and event
//!   delivery.
//! - `retry`: reconnect backoff policy shared by the stream client.

/// Reconnect backoff helpers.
pub mod retry;
/// Realtime stream client, protocol types, and event dispatch.
pub mod stream;

pub use stream::client::{ConnectionStatus, RealtimeClient, RealtimeConfig, RealtimeError};
pub use stream::dispatch::{Event, WILDCARD_EVENT};
