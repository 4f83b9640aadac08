//! # Exponential Backoff
//!
//! Per-item retry delays for the work queue. Each consecutive failure of a
//! key doubles its delay, starting at `base` and capped at `max`.
//!
//! Default sequence for reconcile failures: 5ms, 10ms, 20ms, ... 1000s (max).

use std::time::Duration;

/// Default first retry delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default retry ceiling.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Exponential backoff calculator
///
/// Stateless: the caller tracks the failure count per item, which lets one
/// calculator serve every key in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl ExponentialBackoff {
    /// Create a backoff with the given first delay and ceiling
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the next attempt after `failures` prior failures
    ///
    /// `failures == 0` yields `base`; every further failure doubles it,
    /// saturating at `max`.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        // 2^31 * base already exceeds any sane ceiling
        let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}
