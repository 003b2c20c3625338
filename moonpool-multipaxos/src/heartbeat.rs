//! Failure detection via leader heartbeats.
//!
//! In leader-based mode the ready leader sends `Heartbeat(ballot)` to every
//! follower each `heartbeat_interval`. A follower that hears nothing from
//! the leader for longer than its **election timeout** starts an election.
//!
//! ## Raft Comparison
//!
//! This is Raft's election timeout almost verbatim: the timeout is drawn at
//! random from `[heartbeat_timeout, 2 × heartbeat_timeout)` so that
//! followers rarely time out together and duel.
//!
//! ```text
//! Leader                          Follower
//!   │── Heartbeat(ballot) ─────────>│  record_contact(now)
//!   │<── HeartbeatResponse(ok) ─────│
//!   │                               │
//!   │    ✗ (leader crashes)         │
//!   │                               │  ... election_timeout elapses ...
//!   │                               │  → is_timed_out(now) → start election
//! ```
//!
//! Times are `Duration`s since the node started, read from the tokio clock
//! so that paused-time tests advance them deterministically.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configuration for heartbeats and failure detection.
///
/// ## Tuning Guidelines
///
/// - `heartbeat_timeout` should be > 2× `heartbeat_interval` to tolerate a
///   missed heartbeat without deposing a live leader.
/// - In simulation, these values can be much smaller (e.g., 100ms / 300ms)
///   since logical time has no jitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// How often the leader sends heartbeats.
    pub heartbeat_interval: Duration,

    /// Lower bound of the randomized election timeout.
    pub heartbeat_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(500),
            heartbeat_timeout: Duration::from_secs(2),
        }
    }
}

impl HeartbeatConfig {
    /// Create a heartbeat config suitable for simulation testing.
    pub fn for_simulation() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            heartbeat_timeout: Duration::from_millis(300),
        }
    }

    /// Draw an election timeout in `[heartbeat_timeout, 2 × heartbeat_timeout)`.
    pub fn random_election_timeout(&self, rng: &mut impl Rng) -> Duration {
        let base = self.heartbeat_timeout;
        let jitter_ms = base.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rng.gen_range(0..jitter_ms))
    }
}

/// Tracks the last contact with the leader.
#[derive(Debug, Clone)]
pub struct FailureDetector {
    /// Time of the last leader contact.
    pub last_contact: Duration,

    /// Current randomized election timeout.
    pub election_timeout: Duration,

    config: HeartbeatConfig,
}

impl FailureDetector {
    /// Start tracking at `now` with a freshly drawn timeout.
    pub fn new(config: HeartbeatConfig, now: Duration, rng: &mut impl Rng) -> Self {
        Self {
            last_contact: now,
            election_timeout: config.random_election_timeout(rng),
            config,
        }
    }

    /// Record contact with the leader at `now`.
    pub fn record_contact(&mut self, now: Duration) {
        if now > self.last_contact {
            self.last_contact = now;
        }
    }

    /// Redraw the election timeout, after an election or a step-down.
    pub fn reset_timeout(&mut self, now: Duration, rng: &mut impl Rng) {
        self.record_contact(now);
        self.election_timeout = self.config.random_election_timeout(rng);
    }

    /// Whether the leader has been silent for longer than the timeout.
    pub fn is_timed_out(&self, now: Duration) -> bool {
        self.time_since_last(now) > self.election_timeout
    }

    /// Get the duration since the last contact.
    pub fn time_since_last(&self, now: Duration) -> Duration {
        now.saturating_sub(self.last_contact)
    }
}
