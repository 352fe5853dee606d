//! Server-driven liveness tracking.
//!
//! The server pings every `pingInterval`; each ping pushes the deadline out to
//! `pingInterval + pingTimeout`. Expiry means the link is dead.

use std::time::Duration;

use tracing::trace;

use crate::stream::proto::Handshake;
use crate::stream::timer::Deadline;

#[derive(Debug)]
pub(crate) struct KeepAliveMonitor {
    deadline: Deadline,
    window: Duration,
}

impl KeepAliveMonitor {
    pub(crate) fn new() -> Self {
        Self {
            deadline: Deadline::default(),
            window: Handshake::default().liveness_window(),
        }
    }

    /// Arms the deadline from a freshly received handshake.
    pub(crate) fn start(&mut self, handshake: &Handshake) {
        self.window = handshake.liveness_window();
        self.deadline.arm(self.window);
    }

    /// Pushes the deadline out after a server ping.
    pub(crate) fn on_ping(&mut self) {
        trace!(
            event = "keepalive_reset",
            window_ms = self.window.as_millis() as u64
        );
        self.deadline.arm(self.window);
    }

    pub(crate) fn cancel(&mut self) {
        self.deadline.cancel();
    }

    pub(crate) fn window(&self) -> Duration {
        self.window
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.deadline.is_armed()
    }

    pub(crate) async fn expired(&mut self) {
        self.deadline.expired().await;
    }
}
