//! Node configuration.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::heartbeat::HeartbeatConfig;
use crate::types::PaxosError;

/// How client appends reach consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalMode {
    /// Any node accepts appends; every append runs prepare, propose and
    /// commit under a fresh ballot.
    Leaderless,
    /// One elected leader accepts appends and skips the per-index prepare,
    /// its ballot having been promised for the whole log at election.
    LeaderBased,
}

/// Bounded, jittered retry of a failed append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before the append fails with `WriteTimeout`.
    pub max_attempts: u32,
    /// Smallest pause between attempts.
    pub min_backoff: Duration,
    /// Largest pause between attempts.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_backoff: Duration::ZERO,
            max_backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Draw a pause uniformly from `[min_backoff, max_backoff]`.
    pub fn backoff(&self, rng: &mut impl Rng) -> Duration {
        let min = self.min_backoff.as_millis() as u64;
        let max = self.max_backoff.as_millis() as u64;
        if max <= min {
            return self.min_backoff;
        }
        Duration::from_millis(rng.gen_range(min..=max))
    }
}

/// Everything a node needs to know besides its identity and peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaxosConfig {
    /// Leaderless or leader-based proposals.
    pub mode: ProposalMode,
    /// Deadline of a single request to a peer.
    pub request_timeout: Duration,
    /// How long a client waits for its command to be applied once appended.
    pub client_timeout: Duration,
    /// Period of the node's housekeeping tick.
    pub tick_interval: Duration,
    /// Heartbeats and election timeout.
    pub heartbeat: HeartbeatConfig,
    /// Append retries.
    pub retry: RetryPolicy,
    /// Seed for the node's random source. `None` draws one from entropy.
    pub seed: Option<u64>,
}

impl Default for PaxosConfig {
    fn default() -> Self {
        Self {
            mode: ProposalMode::LeaderBased,
            request_timeout: Duration::from_secs(1),
            client_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_millis(50),
            heartbeat: HeartbeatConfig::default(),
            retry: RetryPolicy::default(),
            seed: None,
        }
    }
}

impl PaxosConfig {
    /// Create a config suitable for simulation testing.
    ///
    /// Uses shorter timeouts since simulation uses logical time.
    pub fn for_simulation() -> Self {
        Self {
            mode: ProposalMode::LeaderBased,
            request_timeout: Duration::from_millis(200),
            client_timeout: Duration::from_secs(2),
            tick_interval: Duration::from_millis(20),
            heartbeat: HeartbeatConfig::for_simulation(),
            retry: RetryPolicy {
                max_attempts: 5,
                min_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(100),
            },
            seed: None,
        }
    }

    /// Same config with another proposal mode.
    pub fn with_mode(mut self, mode: ProposalMode) -> Self {
        self.mode = mode;
        self
    }

    /// Reject configurations the node cannot run with.
    pub fn validate(&self) -> Result<(), PaxosError> {
        if self.retry.max_attempts == 0 {
            return Err(PaxosError::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.min_backoff > self.retry.max_backoff {
            return Err(PaxosError::InvalidConfig(
                "retry.min_backoff exceeds retry.max_backoff".to_string(),
            ));
        }
        if self.request_timeout.is_zero() || self.tick_interval.is_zero() {
            return Err(PaxosError::InvalidConfig(
                "request_timeout and tick_interval must be non-zero".to_string(),
            ));
        }
        if self.heartbeat.heartbeat_timeout <= self.heartbeat.heartbeat_interval {
            return Err(PaxosError::InvalidConfig(
                "heartbeat_timeout must exceed heartbeat_interval".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn test_defaults_validate() {
        PaxosConfig::default().validate().expect("default");
        PaxosConfig::for_simulation().validate().expect("simulation");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PaxosConfig::for_simulation();
        config.retry.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(PaxosError::InvalidConfig(_))
        ));

        let mut config = PaxosConfig::for_simulation();
        config.retry.min_backoff = Duration::from_secs(1);
        assert!(config.validate().is_err());

        let mut config = PaxosConfig::for_simulation();
        config.heartbeat.heartbeat_timeout = config.heartbeat.heartbeat_interval;
        assert!(config.validate().is_err());

        let mut config = PaxosConfig::for_simulation();
        config.tick_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            min_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
        };
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let pause = policy.backoff(&mut rng);
            assert!(pause >= Duration::from_millis(10));
            assert!(pause <= Duration::from_millis(20));
        }
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = PaxosConfig::for_simulation().with_mode(ProposalMode::Leaderless);
        let json = serde_json::to_string(&config).expect("serialize");
        let decoded: PaxosConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(config, decoded);
    }
}
