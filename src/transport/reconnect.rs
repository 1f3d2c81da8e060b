//! Exponential backoff policy for transport reconnection.

use crate::defaults;
use std::time::Duration;

/// Bounded exponential backoff: `min(base * 2^(attempt-1), max)` for up to
/// `max_attempts` attempts, reset to zero on any successful connection.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    attempt: u32,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempt: 0,
            max_attempts: defaults::RECONNECT_MAX_ATTEMPTS,
            base_delay_ms: defaults::RECONNECT_BASE_DELAY_MS,
            max_delay_ms: defaults::RECONNECT_MAX_DELAY_MS,
        }
    }
}

impl ReconnectPolicy {
    /// Creates a policy with explicit bounds.
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Claims the next attempt and returns its backoff delay, or `None` when
    /// the attempt budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        let exp = self.attempt.saturating_sub(1).min(63);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Some(Duration::from_millis(delay))
    }

    /// Resets the attempt counter after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The number of attempts claimed since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// True once the attempt budget is spent.
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
