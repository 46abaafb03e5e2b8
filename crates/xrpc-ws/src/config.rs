//! Engine configuration.

use std::time::Duration;

/// Reconnect backoff: linear in the attempt number.
///
/// `delay(n) = base × (n + 1)`, monotone non-decreasing.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self { base }
    }

    /// Delay before reconnect attempt `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base
            .checked_mul(attempt.saturating_add(1))
            .unwrap_or(Duration::MAX)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
        }
    }
}

/// Configuration for one websocket connection.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Keepalive interval. `None` disables pings on this side. The client
    /// side emits `xrpc.ping`; either side answers with `xrpc.pong`.
    pub ping_interval: Option<Duration>,
    /// Read deadline as a multiple of `ping_interval`. Ignored when pings
    /// are disabled.
    pub timeout_multiplier: u32,
    /// Client side only: give up after the first disconnect instead of
    /// redialling.
    pub no_reconnect: bool,
    /// Client side only: delay schedule between redial attempts.
    pub reconnect_backoff: Backoff,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            ping_interval: None,
            timeout_multiplier: 3,
            no_reconnect: false,
            reconnect_backoff: Backoff::default(),
        }
    }
}

impl WsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }

    pub fn timeout_multiplier(mut self, multiplier: u32) -> Self {
        self.timeout_multiplier = multiplier;
        self
    }

    pub fn no_reconnect(mut self, no_reconnect: bool) -> Self {
        self.no_reconnect = no_reconnect;
        self
    }

    pub fn reconnect_backoff(mut self, backoff: Backoff) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Per-read deadline, when keepalive is enabled.
    pub(crate) fn read_deadline(&self) -> Option<Duration> {
        self.ping_interval
            .map(|p| p.checked_mul(self.timeout_multiplier).unwrap_or(Duration::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_linear_and_monotone() {
        let backoff = Backoff::new(Duration::from_secs(1));
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(3));
        assert!(backoff.delay(5) >= backoff.delay(4));
    }

    #[test]
    fn test_defaults() {
        let config = WsConfig::default();
        assert!(config.ping_interval.is_none());
        assert_eq!(config.timeout_multiplier, 3);
        assert!(!config.no_reconnect);
        assert!(config.read_deadline().is_none());
    }

    #[test]
    fn test_read_deadline_scales_ping_interval() {
        let config = WsConfig::new().ping_interval(Duration::from_secs(5));
        assert_eq!(config.read_deadline(), Some(Duration::from_secs(15)));
    }
}
