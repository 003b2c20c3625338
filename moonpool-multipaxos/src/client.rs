//! Client that finds the leader and retries across leader changes.
//!
//! Any node accepts requests in leaderless mode. In leader-based mode a
//! follower answers `NotLeader` with the leader it last heard from, and the
//! client follows that hint or moves on to the next node.
//!
//! ## Raft Comparison
//!
//! | Aspect | Raft | Multi-Paxos here |
//! |---|---|---|
//! | **Discovery** | Any node redirects | Any node redirects |
//! | **Redirect** | Leader hint in reply | `NotLeader { leader }` |
//! | **Retry** | Client retries with new leader | Retry on redirect or dead node |
//!
//! ## Client Flow
//!
//! ```text
//! Client                 node(2)                 node(1) (leader)
//!   │── execute(cmd) ──────>│                       │
//!   │<── NotLeader(node 1) ─│                       │
//!   │── execute(cmd) ──────────────────────────────>│
//!   │<── CommandResult ─────────────────────────────│
//! ```
//!
//! Only redirects and dead nodes are retried. A timeout is returned to the
//! caller: the command may still be chosen, and a retry would append it a
//! second time under a new request id.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::kv::{Command, CommandResult};
use crate::node::NodeHandle;
use crate::types::{NodeId, PaxosError};

/// Attempts per request, first one included.
const MAX_ATTEMPTS: u32 = 8;

/// Pause between attempts, giving elections time to settle.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Cluster client.
pub struct PaxosClient {
    nodes: Vec<NodeHandle>,
    /// Node the next request goes to first.
    cached_leader: Option<NodeId>,
    cursor: usize,
    max_attempts: u32,
    retry_delay: Duration,
}

impl PaxosClient {
    /// Client over `nodes`.
    pub fn new(nodes: Vec<NodeHandle>) -> Self {
        Self {
            nodes,
            cached_leader: None,
            cursor: 0,
            max_attempts: MAX_ATTEMPTS,
            retry_delay: RETRY_DELAY,
        }
    }

    /// Override the retry budget.
    pub fn with_retries(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// The node requests currently go to first.
    pub fn cached_leader(&self) -> Option<NodeId> {
        self.cached_leader
    }

    /// Replicate `command` and return its result.
    pub async fn execute(&mut self, command: Command) -> Result<CommandResult, PaxosError> {
        self.with_retry(|node| {
            let command = command.clone();
            async move { node.execute(command).await }
        })
        .await
    }

    /// Set `key` to `value`.
    pub async fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<CommandResult, PaxosError> {
        self.execute(Command::Set {
            key: key.into(),
            value: value.into(),
        })
        .await
    }

    /// Linearizable read of `key`.
    pub async fn get(&mut self, key: impl Into<String>) -> Result<Option<String>, PaxosError> {
        let key = key.into();
        self.with_retry(|node| {
            let key = key.clone();
            async move { node.get(key).await }
        })
        .await
    }

    fn target(&self) -> Option<NodeHandle> {
        let cached = self
            .cached_leader
            .and_then(|id| self.nodes.iter().find(|node| node.id() == id));
        cached
            .or_else(|| self.nodes.get(self.cursor % self.nodes.len().max(1)))
            .cloned()
    }

    fn knows(&self, id: NodeId) -> bool {
        self.nodes.iter().any(|node| node.id() == id)
    }

    fn rotate(&mut self) {
        self.cached_leader = None;
        self.cursor = self.cursor.wrapping_add(1);
    }

    async fn with_retry<T, F, Fut>(&mut self, op: F) -> Result<T, PaxosError>
    where
        F: Fn(NodeHandle) -> Fut,
        Fut: Future<Output = Result<T, PaxosError>>,
    {
        let mut last_error = PaxosError::InvalidConfig("client has no nodes".to_string());

        for attempt in 1..=self.max_attempts {
            let Some(node) = self.target() else {
                return Err(last_error);
            };
            let node_id = node.id();

            match op(node).await {
                Ok(value) => {
                    self.cached_leader = Some(node_id);
                    return Ok(value);
                }
                Err(PaxosError::NotLeader { leader }) => {
                    debug!(node = %node_id, leader = ?leader, attempt, "redirected");
                    match leader.filter(|id| *id != node_id && self.knows(*id)) {
                        Some(leader) => self.cached_leader = Some(leader),
                        None => self.rotate(),
                    }
                    last_error = PaxosError::NotLeader { leader };
                }
                Err(err @ (PaxosError::Shutdown | PaxosError::Network(_))) => {
                    warn!(node = %node_id, error = %err, attempt, "node unavailable");
                    self.rotate();
                    last_error = err;
                }
                Err(err) => return Err(err),
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(last_error)
    }
}
