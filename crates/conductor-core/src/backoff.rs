//! Doubling-with-cap delay schedule for reconnects and retries.
//!
//! [`BackoffPolicy`] is the immutable shape of the schedule; [`Backoff`] is
//! the per-loop cursor over it. The delay for attempt `n` (1-based) is
//! `base × 2^(n-1)`, clamped to `max`. Once the cap is reached every later
//! attempt waits exactly `max`. The cursor returns to attempt 1 only through
//! [`Backoff::reset`] or an open period of at least `sustained_open`
//! reported through [`Backoff::record_open`].
//!
//! ```
//! use std::time::Duration;
//! use conductor_core::backoff::{Backoff, BackoffPolicy};
//!
//! let mut backoff = Backoff::new(BackoffPolicy {
//!     base: Duration::from_millis(500),
//!     max: Duration::from_secs(10),
//!     sustained_open: Duration::from_secs(5),
//! });
//! let delays: Vec<u128> = (0..7).map(|_| backoff.next_delay().as_millis()).collect();
//! assert_eq!(delays, [500, 1000, 2000, 4000, 8000, 10_000, 10_000]);
//! ```

use std::time::Duration;

/// Parameters of the delay schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Minimum open period that resets the schedule.
    pub sustained_open: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(10),
            sustained_open: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given 1-based attempt. Attempt 0 is treated as 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Cursor over a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    /// Start a fresh schedule.
    pub const fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Number of delays handed out since the last reset.
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Advance to the next attempt and return its delay.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.policy.delay_for(self.attempt)
    }

    /// Return to the base delay.
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Report how long a connection stayed open.
    ///
    /// Resets the schedule and returns `true` when the period was sustained.
    pub const fn record_open(&mut self, open_for: Duration) -> bool {
        let sustained = open_for.as_nanos() >= self.policy.sustained_open.as_nanos();
        if sustained {
            self.attempt = 0;
        }
        sustained
    }
}
