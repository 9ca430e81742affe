//! Exponential backoff with a ceiling, shared by message requeue and broker
//! reconnection.

use std::time::Duration;

/// Delay for attempt `n` (counting from 0) is `initial * 2^n`, capped at `max`.
///
/// # Default Values
///
/// - `initial`: 1 second
/// - `max`: 10 seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1000),
            max: Duration::from_millis(10_000),
        }
    }
}

impl Backoff {
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}
