//! Timeout configuration for gateway operations.
//!
//! Centralizes every duration the gateway uses: connect handshake,
//! keepalive cadence, and the optional per-call response timeout.

use std::time::Duration;

/// Timeout configuration for the gateway.
///
/// All values have sensible defaults; use the builder for overrides.
///
/// # Examples
///
/// ```rust
/// use exec_link::ExecLinkTimeouts;
/// use std::time::Duration;
///
/// // Defaults (recommended for most cases)
/// let timeouts = ExecLinkTimeouts::default();
///
/// // Custom timeouts for high-latency environments
/// let timeouts = ExecLinkTimeouts::builder()
///     .connection_timeout(Duration::from_secs(30))
///     .call_timeout(Duration::from_secs(60))
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ExecLinkTimeouts {
    /// Timeout for establishing the transport connection (TCP + TLS +
    /// WebSocket handshake). Default: 10 seconds.
    pub connection_timeout: Duration,

    /// Keepalive heartbeat interval while the connection is open. A missing
    /// response to a heartbeat is not itself treated as a failure; only
    /// transport errors drive reconnection. Set to 0 to disable.
    /// Default: 30 seconds.
    pub keepalive_interval: Duration,

    /// Maximum time a request waits for its matching response before the
    /// pending entry is failed and removed. Set to 0 to wait indefinitely
    /// (the historical behavior of this protocol's clients).
    /// Default: 0 (disabled).
    pub call_timeout: Duration,
}

impl Default for ExecLinkTimeouts {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            call_timeout: Duration::ZERO, // Disabled by default
        }
    }
}

impl ExecLinkTimeouts {
    /// Create a new builder for custom timeout configuration.
    pub fn builder() -> ExecLinkTimeoutsBuilder {
        ExecLinkTimeoutsBuilder::new()
    }

    /// Timeouts optimized for fast local development.
    pub fn fast() -> Self {
        Self {
            connection_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(15),
            call_timeout: Duration::from_secs(10),
        }
    }

    /// Timeouts optimized for high-latency or unreliable networks.
    pub fn relaxed() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(60),
            call_timeout: Duration::ZERO,
        }
    }

    /// Check if a duration represents "no timeout" (zero or very large).
    pub fn is_no_timeout(duration: Duration) -> bool {
        duration.is_zero() || duration > Duration::from_secs(86400 * 365) // > 1 year
    }
}

/// Builder for creating custom [`ExecLinkTimeouts`] configurations.
#[derive(Debug, Clone)]
pub struct ExecLinkTimeoutsBuilder {
    timeouts: ExecLinkTimeouts,
}

impl ExecLinkTimeoutsBuilder {
    fn new() -> Self {
        Self {
            timeouts: ExecLinkTimeouts::default(),
        }
    }

    /// Set the transport connection timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connection_timeout = timeout;
        self
    }

    /// Set the transport connection timeout in seconds.
    pub fn connection_timeout_secs(self, secs: u64) -> Self {
        self.connection_timeout(Duration::from_secs(secs))
    }

    /// Set the keepalive heartbeat interval. Set to 0 to disable.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.timeouts.keepalive_interval = interval;
        self
    }

    /// Set the keepalive heartbeat interval in seconds. Set to 0 to disable.
    pub fn keepalive_interval_secs(self, secs: u64) -> Self {
        self.keepalive_interval(Duration::from_secs(secs))
    }

    /// Set the per-call response timeout. Set to 0 to wait indefinitely.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.call_timeout = timeout;
        self
    }

    /// Set the per-call response timeout in seconds. Set to 0 to wait
    /// indefinitely.
    pub fn call_timeout_secs(self, secs: u64) -> Self {
        self.call_timeout(Duration::from_secs(secs))
    }

    /// Build the timeout configuration.
    pub fn build(self) -> ExecLinkTimeouts {
        self.timeouts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let timeouts = ExecLinkTimeouts::default();
        assert_eq!(timeouts.connection_timeout, Duration::from_secs(10));
        assert_eq!(timeouts.keepalive_interval, Duration::from_secs(30));
        assert!(timeouts.call_timeout.is_zero());
    }

    #[test]
    fn test_builder() {
        let timeouts = ExecLinkTimeouts::builder()
            .connection_timeout_secs(60)
            .keepalive_interval_secs(5)
            .call_timeout_secs(30)
            .build();

        assert_eq!(timeouts.connection_timeout, Duration::from_secs(60));
        assert_eq!(timeouts.keepalive_interval, Duration::from_secs(5));
        assert_eq!(timeouts.call_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_is_no_timeout() {
        assert!(ExecLinkTimeouts::is_no_timeout(Duration::ZERO));
        assert!(!ExecLinkTimeouts::is_no_timeout(Duration::from_secs(1)));
    }
}
