//! Consumer retry policy with jittered exponential backoff
//!
//! Consumers never sleep in place between attempts. They compute the delay
//! for the next delivery here and hand the message back to the broker, so a
//! worker is free to pick up other messages while the redelivery is pending.
//!
//! Jitter spreads retries of the same failure across consumers so they do
//! not hit a recovering dependency in lockstep. The randomness source is
//! always supplied by the caller; each worker owns its own generator.

use rand::Rng;
use std::time::Duration;

/// Lower bound of the jitter factor (inclusive)
pub const JITTER_MIN: f64 = 0.8;
/// Upper bound of the jitter factor (exclusive)
pub const JITTER_MAX: f64 = 1.2;

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delivery attempts before a message is dead-lettered
    pub max_attempts: u32,
    /// Base delay before the second attempt
    pub initial_interval: Duration,
    /// Growth factor applied per attempt
    pub multiplier: f64,
    /// Cap on any single delay
    pub max_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_millis(500),
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Delay to wait after a failed `attempt` before the next delivery
    pub fn delay_for<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        backoff_delay(
            attempt,
            self.initial_interval,
            self.multiplier,
            self.max_interval,
            rng,
        )
    }

    /// True once `attempt` has reached the configured ceiling
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Longest time a message can spend between its first delivery and the
    /// point where it is dead-lettered, ignoring handler run time.
    pub fn worst_case_span(&self) -> Duration {
        self.max_interval
            .saturating_mul(self.max_attempts.saturating_sub(1))
    }
}

/// Compute `min(initial * multiplier^(attempt-1) * jitter, max)` with
/// `jitter` drawn uniformly from `[0.8, 1.2)`.
///
/// `attempt` is 1-based; zero is treated as the first attempt. Overflowing or
/// non-finite intermediate values collapse to `max_interval`.
pub fn backoff_delay<R: Rng>(
    attempt: u32,
    initial_interval: Duration,
    multiplier: f64,
    max_interval: Duration,
    rng: &mut R,
) -> Duration {
    let exponent = f64::from(attempt.max(1) - 1);
    let jitter = rng.gen_range(JITTER_MIN..JITTER_MAX);

    let raw = initial_interval.as_secs_f64() * multiplier.powf(exponent) * jitter;
    if !raw.is_finite() {
        return max_interval;
    }

    let capped = raw.max(0.0).min(max_interval.as_secs_f64());
    Duration::try_from_secs_f64(capped).unwrap_or(max_interval)
}
