use std::time::Duration;

/// Linear reconnect backoff capped at five steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    /// Consecutive failures after which to give up. Zero is treated as one.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, max_attempts }
    }

    /// Delay before the next attempt after `failures` consecutive failures,
    /// or `None` once the limit is reached.
    pub fn next_delay(&self, failures: u32) -> Option<Duration> {
        if failures >= self.max_attempts.max(1) {
            return None;
        }
        Some(self.base * failures.clamp(1, 5))
    }
}
