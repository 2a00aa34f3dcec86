//! Retry delays for a stream that keeps failing.

use std::time::Duration;

/// Doubling backoff with a ceiling.
///
/// The n-th consecutive failure waits `min(base * 2^(n-1), max)`. A success
/// resets the sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    consecutive: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            consecutive: 0,
        }
    }

    /// Register a failure and return how long to wait before retrying.
    pub fn on_failure(&mut self) -> Duration {
        self.consecutive = self.consecutive.saturating_add(1);
        let factor = 2u32.saturating_pow(self.consecutive - 1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn on_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }
}
