//! # Moonpool Multi-Paxos: a replicated key-value log
//!
//! This crate implements majority-quorum **multi-Paxos** over an append-only
//! log of opaque values, with a key-value store applied on top. Every log
//! index is decided by its own single-decree Paxos instance; the log applies
//! committed values to the state machine strictly in index order.
//!
//! Two proposal modes share the same acceptor:
//!
//! - **Leaderless**: any node appends by running prepare, propose and commit
//!   under a fresh ballot.
//! - **Leader-based**: a node wins a full-log prepare once, recovers the log,
//!   then appends with propose and commit only. Heartbeats keep followers
//!   from electing a replacement.
//!
//! ## Multi-Paxos vs Raft: A Mental Model
//!
//! | Multi-Paxos Concept | Raft Equivalent | Notes |
//! |---|---|---|
//! | **Ballot** | Term | `(counter, node)`, unique per proposer |
//! | **Acceptor** | Follower | Every node is one |
//! | **Prepare** | *(per-entry RequestVote)* | Leaderless mode, one index |
//! | **Full-log prepare** | RequestVote | Election, returns the voter's log |
//! | **Propose** | AppendEntries | One value at one index |
//! | **Commit** | commitIndex propagation | Chosen value, applied in order |
//! | **Heartbeat** | Empty AppendEntries | Also drives follower catch-up |
//! | **Majority quorum** | Majority quorum | `N / 2 + 1` for every phase |
//!
//! ## Key Differences from Raft
//!
//! 1. **Any node may win an election.** There is no up-to-date check on the
//!    candidate. The full-log prepare returns every voter's accepted values,
//!    and the new leader re-proposes them before serving clients.
//!
//! 2. **Indices are independent.** A hole at one index does not stop later
//!    indices from being chosen. It only delays their application, until the
//!    hole is filled with a no-op.
//!
//! 3. **Values are compared, not entries.** A value may be re-committed at an
//!    index under a higher ballot; it is never replaced by another value.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     PaxosClient                          │
//! │       Follows NotLeader hints, retries dead nodes        │
//! └──────────────────────┬───────────────────────────────────┘
//!                        │ NodeHandle::execute / get
//!                        ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Node                              │
//! │  proposer: prepare / propose / commit per index          │
//! │  election: full-log prepare, log recovery, heartbeats    │
//! │  acceptor: promise / accept / commit, durable log        │
//! │  apply engine: committed entries → KvStore, in order     │
//! └───────────┬──────────────────────────────┬───────────────┘
//!             │ Envelope                     │ PaxosStorage
//!             ▼                              ▼
//! ┌───────────────────┐          ┌───────────────────────────┐
//! │    Transport       │          │  InMemoryPaxosStorage     │
//! │  SimNetwork in     │          │  (or a real WAL)          │
//! │  tests             │          └───────────────────────────┘
//! └───────────────────┘
//! ```
//!
//! ## Crate Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`types`] | Core types: `NodeId`, `Ballot`, `LogIndex`, `ClusterView`, `PaxosError` |
//! | [`slot`] | Per-index acceptor state machine |
//! | [`storage`] | `PaxosStorage` trait and `InMemoryPaxosStorage` implementation |
//! | [`log`] | `ReplicatedLog`: slots, log-wide promise, apply cursor |
//! | [`messages`] | Peer protocol messages and envelopes |
//! | [`acceptor`] | Acceptor handlers for every request |
//! | [`quorum`] | Majority aggregation and request correlation |
//! | [`kv`] | Commands, log records and the `KvStore` state machine |
//! | [`apply`] | In-order, exactly-once application |
//! | [`heartbeat`] | `FailureDetector` and heartbeat timing |
//! | [`election`] | Full-log prepare and snapshot merging |
//! | [`node`] | The node actor and its `NodeHandle` |
//! | [`client`] | `PaxosClient` with leader discovery |
//! | [`config`] | `PaxosConfig` and retry policy |
//! | [`transport`] | The `Transport` trait |
//! | [`sim`] | `SimNetwork` and `SimCluster` for tests |

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod acceptor;
pub mod apply;
pub mod client;
pub mod config;
pub mod election;
pub mod heartbeat;
pub mod kv;
pub mod log;
pub mod messages;
pub mod node;
mod proposer;
pub mod quorum;
pub mod sim;
pub mod slot;
pub mod storage;
pub mod transport;
pub mod types;

// Re-export key types at crate root for convenience
pub use client::PaxosClient;
pub use config::{PaxosConfig, ProposalMode, RetryPolicy};
pub use heartbeat::HeartbeatConfig;
pub use kv::{Command, CommandResult, KvStore, LogRecord, RequestId, StateMachine};
pub use node::{Node, NodeHandle, NodeRole, NodeStatus};
pub use sim::{SimCluster, SimNetwork};
pub use storage::{InMemoryPaxosStorage, PaxosStorage};
pub use transport::Transport;
pub use types::{Ballot, ClusterView, LogIndex, NodeId, PaxosError};
