//! Reconnect backoff for the MQTT connection.
//!
//! The delay starts at `base`, doubles with every consecutive failed attempt
//! and is capped at `max`. It resets to `base` once a connection has stayed
//! up for `stable_after`.

use std::time::Duration;

use tokio::time::Instant;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// First delay.
    pub base: Duration,
    /// Upper bound on the delay.
    pub max: Duration,
    /// Connection lifetime after which the delay resets.
    pub stable_after: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(32),
            stable_after: Duration::from_secs(20),
        }
    }
}

impl BackoffConfig {
    /// Calculate delay for a given attempt number (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Tracks consecutive failures across reconnects.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    connected_at: Option<Instant>,
}

impl Backoff {
    /// Create a backoff tracker.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            connected_at: None,
        }
    }

    /// Number of consecutive failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a successful connection.
    pub fn on_connected(&mut self) {
        self.connected_at = Some(Instant::now());
    }

    /// Record a connection failure or drop and return how long to wait.
    pub fn on_failure(&mut self) -> Duration {
        if let Some(connected_at) = self.connected_at.take()
            && connected_at.elapsed() >= self.config.stable_after
        {
            self.attempt = 0;
        }
        let delay = self.config.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let config = BackoffConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(32));
        assert_eq!(config.delay_for_attempt(6), Duration::from_secs(32));
        assert_eq!(config.delay_for_attempt(40), Duration::from_secs(32));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_grow() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let delays: Vec<_> = (0..4).map(|_| backoff.on_failure()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_connection_does_not_reset() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        backoff.on_failure();
        backoff.on_failure();

        backoff.on_connected();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(backoff.on_failure(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_connection_resets() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        for _ in 0..4 {
            backoff.on_failure();
        }

        backoff.on_connected();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(backoff.on_failure(), Duration::from_secs(1));
        assert_eq!(backoff.attempt(), 1);
    }
}
