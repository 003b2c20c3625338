//! Peer-to-peer protocol messages.
//!
//! Every request a node sends carries a [`CorrelationId`]; the peer echoes
//! it in its reply so the sender can route the reply to the right quorum
//! aggregator. Unsolicited messages (heartbeats, catch-up commits) use
//! [`CorrelationId::NONE`].
//!
//! | Message | Raft Equivalent | Direction |
//! |---|---|---|
//! | `Prepare` / `PrepareResponse` | *(per-entry RequestVote)* | proposer → acceptors |
//! | `Propose` / `ProposeResponse` | AppendEntries | proposer → acceptors |
//! | `Commit` / `CommitResponse` | commitIndex propagation | proposer → acceptors |
//! | `FullLogPrepare` / `FullLogPrepareResponse` | RequestVote | candidate → all |
//! | `Heartbeat` / `HeartbeatResponse` | empty AppendEntries | leader → followers |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{Ballot, LogIndex, NodeId};

/// Identifier pairing a reply with its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    /// Marks a message that expects no routed reply.
    pub const NONE: Self = Self(0);
}

/// A value accepted under a ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedValue {
    /// Ballot the value was accepted under.
    pub ballot: Ballot,
    /// The value.
    pub value: Vec<u8>,
}

/// Prepare for a single index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    /// Index being prepared.
    pub index: LogIndex,
    /// The proposer's fresh ballot.
    pub ballot: Ballot,
}

/// Reply to [`PrepareRequest`].
///
/// The accepted pair is reported whether or not the promise was granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResponse {
    /// Index being prepared.
    pub index: LogIndex,
    /// The ballot this replies to.
    pub ballot: Ballot,
    /// Whether the promise was granted.
    pub promised: bool,
    /// The acceptor's effective promise after handling the request.
    pub promised_ballot: Ballot,
    /// Highest accepted pair at this index, if any.
    pub accepted: Option<AcceptedValue>,
}

/// Ask acceptors to accept `value` at `index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeRequest {
    /// Target index.
    pub index: LogIndex,
    /// Proposer ballot.
    pub ballot: Ballot,
    /// Value to accept.
    pub value: Vec<u8>,
}

/// Reply to [`ProposeRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeResponse {
    /// Target index.
    pub index: LogIndex,
    /// The ballot this replies to.
    pub ballot: Ballot,
    /// Whether the value was accepted.
    pub accepted: bool,
    /// The acceptor's effective promise.
    pub promised_ballot: Ballot,
}

/// Announce that `value` is chosen at `index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    /// Chosen index.
    pub index: LogIndex,
    /// Ballot the value was chosen under.
    pub ballot: Ballot,
    /// The chosen value.
    pub value: Vec<u8>,
}

/// Reply to [`CommitRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResponse {
    /// Chosen index.
    pub index: LogIndex,
    /// Whether the commit was recorded.
    pub success: bool,
}

/// Prepare addressed to the whole log, used to elect a leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullLogPrepareRequest {
    /// Candidate ballot.
    pub ballot: Ballot,
    /// First index the candidate has not applied. Snapshots start here.
    pub from_index: LogIndex,
}

/// Reply to [`FullLogPrepareRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullLogPrepareResponse {
    /// The ballot this replies to.
    pub ballot: Ballot,
    /// Whether the log-wide promise was granted.
    pub promised: bool,
    /// The acceptor's log-wide promise after handling the request.
    pub promised_ballot: Ballot,
    /// Accepted but not yet committed entries, from `from_index` on.
    pub uncommitted: BTreeMap<LogIndex, AcceptedValue>,
    /// Committed entries, from `from_index` on.
    pub committed: BTreeMap<LogIndex, AcceptedValue>,
    /// Highest index this acceptor has touched.
    pub highest_index: Option<LogIndex>,
}

/// Leader liveness signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// The leader's ballot.
    pub ballot: Ballot,
}

/// Reply to [`HeartbeatRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// The ballot this replies to.
    pub ballot: Ballot,
    /// `false` when the follower has promised a higher ballot.
    pub success: bool,
    /// The follower's log-wide promise.
    pub promised_ballot: Ballot,
    /// First index the follower has not applied, used for catch-up.
    pub first_unapplied: LogIndex,
}

/// Every message exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Single-index prepare.
    Prepare(PrepareRequest),
    /// Reply to `Prepare`.
    PrepareResponse(PrepareResponse),
    /// Single-index propose.
    Propose(ProposeRequest),
    /// Reply to `Propose`.
    ProposeResponse(ProposeResponse),
    /// Single-index commit.
    Commit(CommitRequest),
    /// Reply to `Commit`.
    CommitResponse(CommitResponse),
    /// Whole-log prepare.
    FullLogPrepare(FullLogPrepareRequest),
    /// Reply to `FullLogPrepare`.
    FullLogPrepareResponse(FullLogPrepareResponse),
    /// Leader heartbeat.
    Heartbeat(HeartbeatRequest),
    /// Reply to `Heartbeat`.
    HeartbeatResponse(HeartbeatResponse),
}

impl PeerMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Prepare(_) => "prepare",
            PeerMessage::PrepareResponse(_) => "prepare_response",
            PeerMessage::Propose(_) => "propose",
            PeerMessage::ProposeResponse(_) => "propose_response",
            PeerMessage::Commit(_) => "commit",
            PeerMessage::CommitResponse(_) => "commit_response",
            PeerMessage::FullLogPrepare(_) => "full_log_prepare",
            PeerMessage::FullLogPrepareResponse(_) => "full_log_prepare_response",
            PeerMessage::Heartbeat(_) => "heartbeat",
            PeerMessage::HeartbeatResponse(_) => "heartbeat_response",
        }
    }

    /// Whether this message answers a request.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            PeerMessage::PrepareResponse(_)
                | PeerMessage::ProposeResponse(_)
                | PeerMessage::CommitResponse(_)
                | PeerMessage::FullLogPrepareResponse(_)
                | PeerMessage::HeartbeatResponse(_)
        )
    }

    /// The highest ballot this message reveals, used to keep ballot
    /// generation ahead of everything observed.
    pub fn ballot_hint(&self) -> Option<Ballot> {
        match self {
            PeerMessage::Prepare(r) => Some(r.ballot),
            PeerMessage::Propose(r) => Some(r.ballot),
            PeerMessage::Commit(r) => Some(r.ballot),
            PeerMessage::FullLogPrepare(r) => Some(r.ballot),
            PeerMessage::Heartbeat(r) => Some(r.ballot),
            PeerMessage::PrepareResponse(r) => Some(r.promised_ballot),
            PeerMessage::ProposeResponse(r) => Some(r.promised_ballot),
            PeerMessage::FullLogPrepareResponse(r) => Some(r.promised_ballot),
            PeerMessage::HeartbeatResponse(r) => Some(r.promised_ballot),
            PeerMessage::CommitResponse(_) => None,
        }
    }

    /// The promise that caused a refusal, if this is a refusal.
    pub fn rejection(&self) -> Option<Ballot> {
        match self {
            PeerMessage::PrepareResponse(r) if !r.promised => Some(r.promised_ballot),
            PeerMessage::ProposeResponse(r) if !r.accepted => Some(r.promised_ballot),
            PeerMessage::FullLogPrepareResponse(r) if !r.promised => Some(r.promised_ballot),
            PeerMessage::HeartbeatResponse(r) if !r.success => Some(r.promised_ballot),
            _ => None,
        }
    }
}

/// A routed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender.
    pub from: NodeId,
    /// Recipient.
    pub to: NodeId,
    /// Request/reply pairing.
    pub correlation_id: CorrelationId,
    /// Payload.
    pub message: PeerMessage,
}

/// A reply type a quorum aggregator can be built over.
pub trait Reply: Sized {
    /// Extract `Self` from a routed message.
    fn from_message(message: PeerMessage) -> Option<Self>;

    /// The higher promise that caused a refusal.
    fn rejected_by(&self) -> Option<Ballot> {
        None
    }
}

impl Reply for PrepareResponse {
    fn from_message(message: PeerMessage) -> Option<Self> {
        match message {
            PeerMessage::PrepareResponse(r) => Some(r),
            _ => None,
        }
    }

    fn rejected_by(&self) -> Option<Ballot> {
        (!self.promised).then_some(self.promised_ballot)
    }
}

impl Reply for ProposeResponse {
    fn from_message(message: PeerMessage) -> Option<Self> {
        match message {
            PeerMessage::ProposeResponse(r) => Some(r),
            _ => None,
        }
    }

    fn rejected_by(&self) -> Option<Ballot> {
        (!self.accepted).then_some(self.promised_ballot)
    }
}

impl Reply for CommitResponse {
    fn from_message(message: PeerMessage) -> Option<Self> {
        match message {
            PeerMessage::CommitResponse(r) => Some(r),
            _ => None,
        }
    }
}

impl Reply for FullLogPrepareResponse {
    fn from_message(message: PeerMessage) -> Option<Self> {
        match message {
            PeerMessage::FullLogPrepareResponse(r) => Some(r),
            _ => None,
        }
    }

    fn rejected_by(&self) -> Option<Ballot> {
        (!self.promised).then_some(self.promised_ballot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_only_for_refusals() {
        let ballot = Ballot::new(1, NodeId(1));
        let higher = Ballot::new(2, NodeId(2));

        let refused = PeerMessage::ProposeResponse(ProposeResponse {
            index: LogIndex::FIRST,
            ballot,
            accepted: false,
            promised_ballot: higher,
        });
        assert_eq!(refused.rejection(), Some(higher));

        let granted = PeerMessage::PrepareResponse(PrepareResponse {
            index: LogIndex::FIRST,
            ballot,
            promised: true,
            promised_ballot: ballot,
            accepted: None,
        });
        assert_eq!(granted.rejection(), None);
        assert_eq!(granted.ballot_hint(), Some(ballot));
        assert!(granted.is_response());
    }

    #[test]
    fn test_reply_decoding_checks_variant() {
        let message = PeerMessage::CommitResponse(CommitResponse {
            index: LogIndex::new(3),
            success: true,
        });
        assert!(ProposeResponse::from_message(message.clone()).is_none());
        let reply = CommitResponse::from_message(message).expect("commit response");
        assert_eq!(reply.index, LogIndex::new(3));
    }

    #[test]
    fn test_envelope_serde_roundtrip() {
        let envelope = Envelope {
            from: NodeId(1),
            to: NodeId(2),
            correlation_id: CorrelationId(7),
            message: PeerMessage::Propose(ProposeRequest {
                index: LogIndex::new(4),
                ballot: Ballot::new(3, NodeId(1)),
                value: b"payload".to_vec(),
            }),
        };
        let json = serde_json::to_string(&envelope).expect("serialize");
        let decoded: Envelope = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(envelope, decoded);
    }
}
