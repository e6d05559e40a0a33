//! Exponential backoff state for a single source

use std::time::Duration;

use crate::BackoffConfig;

/// `base * 2^retry_count`, capped. Retry policy is plain data: the engine asks
/// for the next delay on failure and resets after a successful tick.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    retry_count: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            retry_count: 0,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Delay for the current failure; bumps the retry count.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.retry_count.min(31)).unwrap_or(u32::MAX);
        let delay = self
            .base
            .checked_mul(factor)
            .unwrap_or(self.cap)
            .min(self.cap);
        self.retry_count = self.retry_count.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.retry_count = 0;
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}
