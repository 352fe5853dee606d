//! Reconnect backoff and attempt accounting.
//!
//! The policy is transport-agnostic: it only decides how long to wait before
//! the next attempt and when to stop trying.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Policy controlling reconnect attempts and backoff growth.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts tolerated before giving up.
    pub max_attempts: u32,
    /// Delay added per attempt (`attempt * step`).
    pub step: Duration,
    /// Upper bound for backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each delay. Zero disables jitter.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
    pub const DEFAULT_STEP: Duration = Duration::from_secs(2);
    pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

    /// Computes the delay to apply before the given reconnect attempt.
    ///
    /// `attempt` is 1-based.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = std::cmp::min(self.step.saturating_mul(attempt), self.max_backoff);
        delay + jitter_duration(self.jitter, attempt)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            step: Self::DEFAULT_STEP,
            max_backoff: Self::DEFAULT_MAX_BACKOFF,
            jitter: Duration::ZERO,
        }
    }
}

/// Outcome of asking the scheduler for the next attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReconnectDecision {
    /// Try again after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// The attempt ceiling was reached; stop reconnecting.
    Exhausted { attempts: u32 },
}

/// Counts consecutive failed attempts against a [`ReconnectPolicy`].
#[derive(Clone, Debug)]
pub struct ReconnectScheduler {
    policy: ReconnectPolicy,
    attempt_count: u32,
}

impl ReconnectScheduler {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt_count: 0,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Registers a failure and decides whether another attempt is allowed.
    pub fn next_attempt(&mut self) -> ReconnectDecision {
        if self.attempt_count >= self.policy.max_attempts {
            return ReconnectDecision::Exhausted {
                attempts: self.attempt_count,
            };
        }

        self.attempt_count += 1;
        let delay = self.policy.delay_for_attempt(self.attempt_count);
        debug!(
            event = "reconnect_backoff",
            attempt = self.attempt_count,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64
        );
        ReconnectDecision::Retry {
            attempt: self.attempt_count,
            delay,
        }
    }

    /// Clears the failure streak after a successful connection.
    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }
}

fn jitter_duration(max_jitter: Duration, attempt: u32) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
