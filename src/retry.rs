//! Capped exponential backoff.
//!
//! Shared by the processing queue (retry delay of a requeued job) and the
//! upload manager (delay between attempts and the growing per-attempt
//! timeout). The sequence for base 500 ms / max 30 s is
//! 500 ms, 1 s, 2 s, 4 s and so on until it flattens at 30 s.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
    }

    /// `min(base * 2^exponent, max)`, saturating instead of overflowing.
    pub fn delay(&self, exponent: u32) -> Duration {
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}
