//! Election timing.

use std::time::Duration;

use crate::error::ConfigError;

/// Timing knobs for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionConfig {
    /// Longest the event loop sleeps before re-checking timeouts.
    /// Default: 2s
    pub poll_interval: Duration,

    /// How long an outbound connection may wait for a reply (or to connect)
    /// before the peer is treated as failed.
    /// Default: 2s
    pub failure_timeout: Duration,

    /// Gap between liveness probes of the current leader.
    /// Default: 3s
    pub probe_interval: Duration,

    /// How long a node that was told to stand down waits for the winner's
    /// COORDINATOR before starting over.
    /// Default: 6s
    pub victor_timeout: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            failure_timeout: Duration::from_secs(2),
            probe_interval: Duration::from_secs(3),
            victor_timeout: Duration::from_secs(6),
        }
    }
}

impl ElectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_failure_timeout(mut self, timeout: Duration) -> Self {
        self.failure_timeout = timeout;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_victor_timeout(mut self, timeout: Duration) -> Self {
        self.victor_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("poll interval", self.poll_interval),
            ("failure timeout", self.failure_timeout),
            ("probe interval", self.probe_interval),
            ("victor timeout", self.victor_timeout),
        ];
        for (name, value) in fields {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_timing() {
        let config = ElectionConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.failure_timeout, Duration::from_secs(2));
        assert!(config.victor_timeout > config.failure_timeout);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_durations_are_rejected() {
        let config = ElectionConfig::new().with_failure_timeout(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroDuration("failure timeout"))
        ));
    }
}
