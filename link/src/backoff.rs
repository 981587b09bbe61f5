//! Capped exponential backoff.
//!
//! [`Backoff::next_delay`] is a pure function of the attempt number so retry
//! schedules can be asserted exactly. Randomness is layered on explicitly via
//! [`Backoff::jittered`] and only when a non-zero jitter factor is configured.

use rand::Rng;
use std::time::Duration;

/// Delay policy: `min(initial * multiplier^attempt, max)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
}

impl Backoff {
    /// Create a doubling backoff starting at `initial` and capped at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    /// Growth factor applied per attempt. Values below 1.0 are clamped to 1.0
    /// so the sequence never decreases.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 };
        self
    }

    /// Random spread (0.0..=1.0) applied by [`Backoff::jittered`].
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter = if factor.is_finite() { factor.clamp(0.0, 1.0) } else { 0.0 };
        self
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Deterministic delay for the given zero-based attempt.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = initial_ms * self.multiplier.powi(exponent);
        if !raw.is_finite() || raw >= max_ms {
            return self.max;
        }
        Duration::from_millis(raw as u64)
    }

    /// Apply the configured ±jitter to `delay`, clamped to `[0, max]`.
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter == 0.0 {
            return delay;
        }
        let delay_ms = delay.as_millis() as f64;
        let span = delay_ms * self.jitter;
        let offset = rand::rng().random_range(-span..=span);
        let jittered = (delay_ms + offset).clamp(0.0, self.max.as_millis() as f64);
        Duration::from_millis(jittered as u64)
    }

    /// Jittered delay for the given attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.jittered(self.next_delay(attempt))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(32_000))
    }
}

/// Stateful wrapper that counts consecutive failures.
#[derive(Debug, Clone)]
pub struct BackoffTimer {
    backoff: Backoff,
    failures: u32,
}

impl BackoffTimer {
    pub fn new(backoff: Backoff) -> Self {
        Self { backoff, failures: 0 }
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn next(&mut self) -> Duration {
        let delay = self.backoff.delay_for(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Forget all recorded failures.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Number of consecutive failures recorded since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }
}
