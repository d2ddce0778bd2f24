use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::error::ApiError;

/// Enforces a minimum interval between workload creations.
#[derive(Debug)]
pub struct CreateLimiter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl CreateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Record a creation attempt, or reject it if the previous one was too recent.
    pub fn check(&self) -> Result<(), ApiError> {
        if self.interval.is_zero() {
            return Ok(());
        }
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if let Some(prev) = *last {
            let elapsed = now.duration_since(prev);
            if elapsed < self.interval {
                let wait = self.interval - elapsed;
                return Err(ApiError::TooManyRequests(format!(
                    "create rate limit exceeded, retry in {}ms",
                    wait.as_millis().max(1)
                )));
            }
        }
        *last = Some(now);
        Ok(())
    }
}
