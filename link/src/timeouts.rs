//! Timeout configuration for the realtime connection.
//!
//! Every wait performed by the socket and the reconnection controller is
//! bounded by one of these values.

use std::time::Duration;

/// Timeouts applied to socket open, registration and liveness checks.
///
/// # Examples
///
/// ```rust
/// use mercury_link::MercuryTimeouts;
/// use std::time::Duration;
///
/// let timeouts = MercuryTimeouts::builder()
///     .registration_timeout(Duration::from_secs(30))
///     .ping_interval_secs(60)
///     .build();
///
/// assert_eq!(timeouts.ping_interval, Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MercuryTimeouts {
    /// Timeout for opening the socket (TCP + TLS + upgrade).
    /// Default: 10 seconds
    pub connection_timeout: Duration,

    /// Maximum time between sending the authorization message and receiving
    /// the registration acknowledgement.
    /// Default: 10 seconds
    pub registration_timeout: Duration,

    /// Delay between a pong and the next ping. Set to 0 to disable pings.
    /// Default: 15 seconds
    pub ping_interval: Duration,

    /// Maximum wait for the pong matching an outstanding ping.
    /// Default: 14 seconds
    pub pong_timeout: Duration,

    /// How long a locally initiated close may wait for the remote close frame
    /// before the socket is torn down anyway.
    /// Default: 2 seconds
    pub force_close_delay: Duration,
}

impl Default for MercuryTimeouts {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            registration_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(14),
            force_close_delay: Duration::from_secs(2),
        }
    }
}

impl MercuryTimeouts {
    pub fn builder() -> MercuryTimeoutsBuilder {
        MercuryTimeoutsBuilder::new()
    }

    /// Short timeouts for localhost servers and tests.
    pub fn fast() -> Self {
        Self {
            connection_timeout: Duration::from_secs(2),
            registration_timeout: Duration::from_secs(2),
            ping_interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(2),
            force_close_delay: Duration::from_millis(500),
        }
    }

    /// Long timeouts for high-latency or unreliable networks.
    pub fn relaxed() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            registration_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(25),
            force_close_delay: Duration::from_secs(5),
        }
    }

    /// Whether liveness pings are enabled.
    pub fn pings_enabled(&self) -> bool {
        !self.ping_interval.is_zero()
    }
}

/// Builder for [`MercuryTimeouts`].
#[derive(Debug, Clone)]
pub struct MercuryTimeoutsBuilder {
    timeouts: MercuryTimeouts,
}

impl MercuryTimeoutsBuilder {
    fn new() -> Self {
        Self {
            timeouts: MercuryTimeouts::default(),
        }
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connection_timeout = timeout;
        self
    }

    pub fn connection_timeout_secs(self, secs: u64) -> Self {
        self.connection_timeout(Duration::from_secs(secs))
    }

    pub fn registration_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.registration_timeout = timeout;
        self
    }

    pub fn registration_timeout_secs(self, secs: u64) -> Self {
        self.registration_timeout(Duration::from_secs(secs))
    }

    /// Set to 0 to disable pings.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.timeouts.ping_interval = interval;
        self
    }

    pub fn ping_interval_secs(self, secs: u64) -> Self {
        self.ping_interval(Duration::from_secs(secs))
    }

    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.pong_timeout = timeout;
        self
    }

    pub fn pong_timeout_secs(self, secs: u64) -> Self {
        self.pong_timeout(Duration::from_secs(secs))
    }

    pub fn force_close_delay(mut self, delay: Duration) -> Self {
        self.timeouts.force_close_delay = delay;
        self
    }

    pub fn build(self) -> MercuryTimeouts {
        self.timeouts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let timeouts = MercuryTimeouts::default();
        assert_eq!(timeouts.connection_timeout, Duration::from_secs(10));
        assert_eq!(timeouts.ping_interval, Duration::from_secs(15));
        assert_eq!(timeouts.pong_timeout, Duration::from_secs(14));
        assert!(timeouts.pings_enabled());
    }

    #[test]
    fn test_builder() {
        let timeouts = MercuryTimeouts::builder()
            .connection_timeout_secs(60)
            .ping_interval(Duration::ZERO)
            .force_close_delay(Duration::from_millis(10))
            .build();

        assert_eq!(timeouts.connection_timeout, Duration::from_secs(60));
        assert!(!timeouts.pings_enabled());
        assert_eq!(timeouts.force_close_delay, Duration::from_millis(10));
    }

    #[test]
    fn test_presets() {
        assert!(MercuryTimeouts::fast().connection_timeout <= Duration::from_secs(5));
        assert!(MercuryTimeouts::relaxed().registration_timeout >= Duration::from_secs(30));
    }
}
