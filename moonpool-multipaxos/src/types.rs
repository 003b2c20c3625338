//! Core types for the multi-Paxos engine.
//!
//! This module defines the fundamental building blocks used throughout
//! the implementation:
//!
//! - [`NodeId`]: Identity of a cluster member
//! - [`Ballot`]: Totally ordered proposal-generation identifier (like Raft's "term")
//! - [`LogIndex`]: Position in the replicated log (like Raft's "log index")
//! - [`ClusterView`]: The fixed member set and its majority quorum
//! - [`PaxosError`]: Error type for all Paxos operations

use serde::{Deserialize, Serialize};

/// Identity of a node in the cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Create a new node identifier.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node({})", self.0)
    }
}

/// Ballot: a `(counter, node)` pair, totally ordered lexicographically.
///
/// In Raft terms, the counter is the **term**; the node id breaks ties so
/// that two nodes can never generate the same ballot. A node generates a
/// fresh ballot by incrementing the highest counter it has observed and
/// pairing it with its own id.
///
/// # Invariants
///
/// - Field order matters: the derived `Ord` compares `counter` first, then `node`.
/// - [`Ballot::EMPTY`] is lower than every ballot a node can generate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Ballot {
    /// Generation counter, incremented past the highest one observed.
    pub counter: u64,
    /// The node that generated this ballot.
    pub node: NodeId,
}

impl Ballot {
    /// The lowest possible ballot, meaning "nothing promised yet".
    pub const EMPTY: Self = Self {
        counter: 0,
        node: NodeId(0),
    };

    /// Create a ballot.
    pub const fn new(counter: u64, node: NodeId) -> Self {
        Self { counter, node }
    }

    /// Returns `true` if `self` is strictly after `other`.
    ///
    /// `a.is_after(b)` iff `a.counter > b.counter`, or the counters are equal
    /// and `a.node > b.node`.
    pub fn is_after(&self, other: &Ballot) -> bool {
        self > other
    }

    /// Returns `true` for [`Ballot::EMPTY`].
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl std::fmt::Display for Ballot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ballot({},{})", self.counter, self.node.0)
    }
}

/// Log index: a position in the replicated log.
///
/// Each index is decided by its own independent Paxos instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogIndex(pub u64);

impl LogIndex {
    /// The first valid log index.
    pub const FIRST: Self = Self(0);

    /// Create a new log index.
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// Get the next sequential index.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for LogIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "index({})", self.0)
    }
}

/// The fixed set of cluster members, self included.
///
/// Membership never changes at runtime. A quorum is any strict majority:
/// `quorum_size = N / 2 + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    members: Vec<NodeId>,
}

impl ClusterView {
    /// Build a view from an ordered member list.
    ///
    /// Fails on an empty list or duplicate ids.
    pub fn new(members: Vec<NodeId>) -> Result<Self, PaxosError> {
        if members.is_empty() {
            return Err(PaxosError::InvalidConfig(
                "cluster must have at least one member".to_string(),
            ));
        }
        for (i, member) in members.iter().enumerate() {
            if members[..i].contains(member) {
                return Err(PaxosError::InvalidConfig(format!(
                    "duplicate cluster member {member}"
                )));
            }
        }
        Ok(Self { members })
    }

    /// Members in their configured order.
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always `false`: a view is never empty.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Majority size.
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Whether `node` belongs to the cluster.
    pub fn contains(&self, node: NodeId) -> bool {
        self.members.contains(&node)
    }
}

/// Errors that can occur during Paxos operations.
///
/// | Error | Raft Equivalent | When it happens |
/// |-------|-----------------|-----------------|
/// | `RejectedBallot` | Stale term | A peer has promised a higher ballot |
/// | `QuorumUnreachable` | Replication failure | Too many errors/timeouts to reach a majority |
/// | `WriteTimeout` | *(N/A)* | Retry budget exhausted for a client append |
/// | `InvalidState` | *(N/A)* | A local protocol invariant would be violated |
/// | `NotLeader` | Not leader | Leader-based mode, request sent to a non-leader |
/// | `RequestTimeout` | RPC timeout | A single request or client wait expired |
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaxosError {
    /// A peer refused the ballot because it promised a higher one.
    ///
    /// Recoverable by retrying with a fresh, higher ballot at the next index.
    #[error("{ballot} rejected: peer promised {promised}")]
    RejectedBallot {
        /// The ballot that was refused.
        ballot: Ballot,
        /// The highest promise reported by the rejecting peers.
        promised: Ballot,
    },

    /// Too many peers failed or refused for a quorum to be possible.
    #[error("quorum unreachable: got {got} of {needed} responses")]
    QuorumUnreachable {
        /// Matching responses received.
        got: usize,
        /// Matching responses needed.
        needed: usize,
    },

    /// The append retry budget is exhausted.
    #[error("write timed out after {attempts} attempts")]
    WriteTimeout {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// A protocol invariant would be violated by this message.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// This node cannot accept client appends right now.
    #[error("not the leader (last known leader: {leader:?})")]
    NotLeader {
        /// Last leader this node heard from, if any.
        leader: Option<NodeId>,
    },

    /// A request or client wait exceeded its deadline.
    #[error("request timed out")]
    RequestTimeout,

    /// Transport-level error.
    #[error("network error: {0}")]
    Network(String),

    /// Durable log error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization or deserialization error.
    #[error("codec error: {0}")]
    Codec(String),

    /// Rejected configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The node has shut down.
    #[error("node is shut down")]
    Shutdown,
}

impl From<serde_json::Error> for PaxosError {
    fn from(err: serde_json::Error) -> Self {
        PaxosError::Codec(err.to_string())
    }
}
