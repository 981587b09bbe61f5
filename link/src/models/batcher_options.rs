use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::Backoff;

/// Flush and retry policy of a [`Batcher`](crate::batcher::Batcher).
///
/// A flush happens when no item arrived for `wait_ms`, when `max_wait_ms`
/// passed since the first pending item, or when `max_calls` items are queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatcherOptions {
    /// Default: 100ms
    #[serde(default = "default_wait_ms")]
    pub wait_ms: u64,

    /// Default: 1500ms
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Default: 50
    #[serde(default = "default_max_calls")]
    pub max_calls: usize,

    /// Keep successful outcomes until invalidated.
    #[serde(default)]
    pub cache_successes: bool,

    /// Keep failed outcomes until invalidated.
    #[serde(default)]
    pub cache_failures: bool,

    /// Network retries per item before it is rejected.
    /// Default: 3
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Default: 1000ms
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Default: 30000ms
    #[serde(default = "default_retry_delay_max_ms")]
    pub retry_delay_max_ms: u64,
}

fn default_wait_ms() -> u64 {
    100
}

fn default_max_wait_ms() -> u64 {
    1500
}

fn default_max_calls() -> usize {
    50
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_retry_delay_max_ms() -> u64 {
    30000
}

impl Default for BatcherOptions {
    fn default() -> Self {
        Self {
            wait_ms: 100,
            max_wait_ms: 1500,
            max_calls: 50,
            cache_successes: false,
            cache_failures: false,
            max_retries: 3,
            retry_delay_ms: 1000,
            retry_delay_max_ms: 30000,
        }
    }
}

impl BatcherOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wait_ms(mut self, ms: u64) -> Self {
        self.wait_ms = ms;
        self
    }

    pub fn with_max_wait_ms(mut self, ms: u64) -> Self {
        self.max_wait_ms = ms;
        self
    }

    pub fn with_max_calls(mut self, max: usize) -> Self {
        self.max_calls = max;
        self
    }

    pub fn with_cache_successes(mut self, enabled: bool) -> Self {
        self.cache_successes = enabled;
        self
    }

    pub fn with_cache_failures(mut self, enabled: bool) -> Self {
        self.cache_failures = enabled;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_retry_delay_ms(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.retry_delay_ms = initial_ms;
        self.retry_delay_max_ms = max_ms;
        self
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// `max_calls`, never less than one.
    pub fn batch_limit(&self) -> usize {
        self.max_calls.max(1)
    }

    pub fn retry_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.retry_delay_ms),
            Duration::from_millis(self.retry_delay_max_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_partial_json() {
        let options: BatcherOptions = serde_json::from_str(r#"{"max_calls": 10}"#).unwrap();
        assert_eq!(options.max_calls, 10);
        assert_eq!(options.wait_ms, 100);
        assert_eq!(options.max_wait_ms, 1500);
        assert!(!options.cache_successes);
    }

    #[test]
    fn test_zero_max_calls_is_clamped() {
        assert_eq!(BatcherOptions::default().with_max_calls(0).batch_limit(), 1);
    }
}
