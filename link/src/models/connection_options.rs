use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::Backoff;

/// What the event bus does when its pending queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest buffered envelope to make room.
    #[default]
    DropOldest,
    /// Discard the whole queue and reconnect so the server replays state.
    Resynchronize,
}

/// Connection-level options for the realtime client.
///
/// # Example
///
/// ```rust
/// use mercury_link::MercuryOptions;
///
/// let options = MercuryOptions::default()
///     .with_backoff_time_max_ms(8_000)
///     .with_max_retries(Some(5))
///     .with_shared_registration(true);
/// assert_eq!(options.max_retries, Some(5));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MercuryOptions {
    /// Reconnect after transient connection loss.
    /// Default: true
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    /// First backoff delay in milliseconds.
    /// Default: 1000ms
    #[serde(default = "default_backoff_time_reset_ms")]
    pub backoff_time_reset_ms: u64,

    /// Backoff ceiling in milliseconds.
    /// Default: 32000ms
    #[serde(default = "default_backoff_time_max_ms")]
    pub backoff_time_max_ms: u64,

    /// Default: 2.0
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Random ± spread applied on top of each delay (0.0 to 1.0).
    /// Default: 0.0
    #[serde(default)]
    pub backoff_jitter: f64,

    /// Consecutive failures tolerated before giving up.
    /// Default: None (retry forever)
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Failures tolerated before the first successful registration. Once
    /// the client has registered, `max_retries` applies instead.
    /// Default: None (use `max_retries`)
    #[serde(default)]
    pub initial_connection_max_retries: Option<u32>,

    /// Maximum envelopes buffered while the bus is not ready.
    /// Default: 10000
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    #[serde(default)]
    pub overflow_policy: OverflowPolicy,

    /// Ask the server to send a buffer-state event after authorization.
    /// Default: true
    #[serde(default = "default_buffer_states")]
    pub buffer_states: bool,

    /// Share one registration across connections and receive
    /// registration-status events.
    /// Default: false
    #[serde(default)]
    pub shared_registration: bool,

    /// Allow several concurrent connections for the same device.
    /// Default: false
    #[serde(default)]
    pub multiple_connections: bool,
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_backoff_time_reset_ms() -> u64 {
    1000
}

fn default_backoff_time_max_ms() -> u64 {
    32000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_buffer_states() -> bool {
    true
}

impl Default for MercuryOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            backoff_time_reset_ms: 1000,
            backoff_time_max_ms: 32000,
            backoff_multiplier: 2.0,
            backoff_jitter: 0.0,
            max_retries: None,
            initial_connection_max_retries: None,
            buffer_capacity: 10_000,
            overflow_policy: OverflowPolicy::DropOldest,
            buffer_states: true,
            shared_registration: false,
            multiple_connections: false,
        }
    }
}

impl MercuryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_backoff_time_reset_ms(mut self, ms: u64) -> Self {
        self.backoff_time_reset_ms = ms;
        self
    }

    pub fn with_backoff_time_max_ms(mut self, ms: u64) -> Self {
        self.backoff_time_max_ms = ms;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_backoff_jitter(mut self, jitter: f64) -> Self {
        self.backoff_jitter = jitter;
        self
    }

    /// `None` retries forever.
    pub fn with_max_retries(mut self, max: Option<u32>) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_initial_connection_max_retries(mut self, max: Option<u32>) -> Self {
        self.initial_connection_max_retries = max;
        self
    }

    /// Retry cap for the next connection attempt.
    pub fn retry_limit(&self, has_ever_connected: bool) -> Option<u32> {
        match self.initial_connection_max_retries {
            Some(initial) if !has_ever_connected => Some(initial),
            _ => self.max_retries,
        }
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    pub fn with_buffer_states(mut self, enabled: bool) -> Self {
        self.buffer_states = enabled;
        self
    }

    pub fn with_shared_registration(mut self, enabled: bool) -> Self {
        self.shared_registration = enabled;
        self
    }

    pub fn with_multiple_connections(mut self, enabled: bool) -> Self {
        self.multiple_connections = enabled;
        self
    }

    /// Reconnect delay policy derived from the backoff fields.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_time_reset_ms),
            Duration::from_millis(self.backoff_time_max_ms),
        )
        .with_multiplier(self.backoff_multiplier)
        .with_jitter(self.backoff_jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let options: MercuryOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, MercuryOptions::default());
    }

    #[test]
    fn test_backoff_uses_configured_bounds() {
        let backoff = MercuryOptions::default()
            .with_backoff_time_reset_ms(50)
            .with_backoff_time_max_ms(200)
            .backoff();
        assert_eq!(backoff.next_delay(0), Duration::from_millis(50));
        assert_eq!(backoff.next_delay(10), Duration::from_millis(200));
    }

    #[test]
    fn test_retry_limit_before_and_after_first_registration() {
        let options = MercuryOptions::default()
            .with_max_retries(Some(5))
            .with_initial_connection_max_retries(Some(1));
        assert_eq!(options.retry_limit(false), Some(1));
        assert_eq!(options.retry_limit(true), Some(5));

        let options = MercuryOptions::default().with_max_retries(Some(5));
        assert_eq!(options.retry_limit(false), Some(5));
    }

    #[test]
    fn test_overflow_policy_serde() {
        let options: MercuryOptions =
            serde_json::from_str(r#"{"overflow_policy":"resynchronize"}"#).unwrap();
        assert_eq!(options.overflow_policy, OverflowPolicy::Resynchronize);
    }
}
