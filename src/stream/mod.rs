//! Realtime event stream modules.
//!
//! - `client`: public handle, configuration, and error taxonomy.
//! - `controller`: connection state machine driving reconnects and keep-alive.
//! - `proto`: two-layer frame codec.
//! - `transport`: websocket transport and its generation-tagged callbacks.
//! - `subscription` / `dispatch`: subscription replay and handler delivery.

/// Client handle and configuration.
pub mod client;
/// Connection state machine.
pub mod controller;
/// Event handler registry and delivery.
pub mod dispatch;
mod keepalive;
/// Wire format.
pub mod proto;
/// Identity and topic replay.
pub mod subscription;
mod timer;
/// Physical socket layer.
pub mod transport;
