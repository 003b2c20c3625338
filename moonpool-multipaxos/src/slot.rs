//! Per-index acceptor state.
//!
//! Every log index runs its own Paxos instance. [`SlotState`] is the acceptor
//! side of that instance: the highest ballot promised for the index plus a
//! [`SlotPhase`] that records how far the instance has progressed.
//!
//! ## Transitions
//!
//! ```text
//!            promise(b)             accept(b, v)              commit(b, v)
//!   Empty ─────────────> Promised ─────────────> Accepted ─────────────> Committed
//!                           ▲  │                    │ ▲
//!                           └──┘ higher promise     └─┘ higher accept overwrites
//! ```
//!
//! A higher promise never erases an accepted value: the proposer needs it
//! to carry the value forward. A committed value is final; the only change
//! allowed afterwards is a re-commit of the same value under a newer ballot.
//!
//! Ballot checks live in the acceptor, which compares against the effective
//! promise of the whole log. The methods here only perform the transition.

use serde::{Deserialize, Serialize};

use crate::messages::AcceptedValue;
use crate::types::{Ballot, PaxosError};

/// How far the Paxos instance for one index has progressed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotPhase {
    /// Never touched by a prepare, propose or commit.
    #[default]
    Empty,
    /// Promised `ballot`, nothing accepted yet.
    Promised(Ballot),
    /// Accepted `value` under `ballot`.
    Accepted {
        /// Ballot of the proposal that was accepted.
        ballot: Ballot,
        /// The accepted value.
        value: Vec<u8>,
    },
    /// `value` is chosen.
    Committed {
        /// Ballot carried by the commit.
        ballot: Ballot,
        /// The chosen value.
        value: Vec<u8>,
    },
}

/// Acceptor state for one log index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotState {
    promised: Ballot,
    phase: SlotPhase,
}

impl SlotState {
    /// A fresh, untouched slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest ballot promised for this index alone.
    pub fn promised(&self) -> Ballot {
        self.promised
    }

    /// Current phase.
    pub fn phase(&self) -> &SlotPhase {
        &self.phase
    }

    /// The accepted `(ballot, value)` pair, committed or not.
    pub fn accepted(&self) -> Option<AcceptedValue> {
        match &self.phase {
            SlotPhase::Accepted { ballot, value } | SlotPhase::Committed { ballot, value } => {
                Some(AcceptedValue {
                    ballot: *ballot,
                    value: value.clone(),
                })
            }
            SlotPhase::Empty | SlotPhase::Promised(_) => None,
        }
    }

    /// Whether the value at this index is chosen.
    pub fn is_committed(&self) -> bool {
        matches!(self.phase, SlotPhase::Committed { .. })
    }

    /// The chosen value, if committed.
    pub fn committed_value(&self) -> Option<&[u8]> {
        match &self.phase {
            SlotPhase::Committed { value, .. } => Some(value),
            _ => None,
        }
    }

    /// The ballot the chosen value was committed under.
    pub fn committed_ballot(&self) -> Option<Ballot> {
        match &self.phase {
            SlotPhase::Committed { ballot, .. } => Some(*ballot),
            _ => None,
        }
    }

    /// Record a promise for `ballot`.
    ///
    /// The caller has already checked that `ballot` is after the effective
    /// promise.
    pub fn promise(&mut self, ballot: Ballot) {
        self.promised = self.promised.max(ballot);
        if matches!(self.phase, SlotPhase::Empty | SlotPhase::Promised(_)) {
            self.phase = SlotPhase::Promised(self.promised);
        }
    }

    /// Accept `value` under `ballot`.
    ///
    /// On a committed slot the same value is acknowledged without leaving
    /// `Committed`; a different value is refused.
    pub fn accept(&mut self, ballot: Ballot, value: Vec<u8>) -> Result<(), PaxosError> {
        if let SlotPhase::Committed {
            value: committed, ..
        } = &self.phase
        {
            if *committed != value {
                return Err(PaxosError::InvalidState(format!(
                    "propose under {ballot} conflicts with committed value"
                )));
            }
            self.promised = self.promised.max(ballot);
            return Ok(());
        }
        self.promised = self.promised.max(ballot);
        self.phase = SlotPhase::Accepted { ballot, value };
        Ok(())
    }

    /// Mark `value` chosen under `ballot`.
    ///
    /// Returns `true` if the slot was not committed before. Re-committing
    /// the same value keeps the highest ballot seen.
    pub fn commit(&mut self, ballot: Ballot, value: Vec<u8>) -> Result<bool, PaxosError> {
        match &mut self.phase {
            SlotPhase::Committed {
                ballot: committed_ballot,
                value: committed,
            } => {
                if *committed != value {
                    return Err(PaxosError::InvalidState(format!(
                        "commit under {ballot} conflicts with value committed under {committed_ballot}"
                    )));
                }
                if ballot.is_after(committed_ballot) {
                    *committed_ballot = ballot;
                }
                Ok(false)
            }
            _ => {
                self.phase = SlotPhase::Committed { ballot, value };
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    fn ballot(counter: u64, node: u32) -> Ballot {
        Ballot::new(counter, NodeId(node))
    }

    #[test]
    fn test_promise_moves_empty_to_promised() {
        let mut slot = SlotState::new();
        slot.promise(ballot(1, 1));

        assert_eq!(slot.promised(), ballot(1, 1));
        assert_eq!(slot.phase(), &SlotPhase::Promised(ballot(1, 1)));
        assert!(slot.accepted().is_none());
    }

    #[test]
    fn test_promise_keeps_accepted_value() {
        let mut slot = SlotState::new();
        slot.accept(ballot(1, 1), b"x".to_vec()).expect("accept");
        slot.promise(ballot(2, 2));

        assert_eq!(slot.promised(), ballot(2, 2));
        let accepted = slot.accepted().expect("still accepted");
        assert_eq!(accepted.ballot, ballot(1, 1));
        assert_eq!(accepted.value, b"x");
    }

    #[test]
    fn test_higher_accept_overwrites() {
        let mut slot = SlotState::new();
        slot.accept(ballot(1, 1), b"first".to_vec()).expect("accept");
        slot.accept(ballot(2, 1), b"second".to_vec()).expect("accept");

        assert_eq!(
            slot.phase(),
            &SlotPhase::Accepted {
                ballot: ballot(2, 1),
                value: b"second".to_vec()
            }
        );
        assert_eq!(slot.promised(), ballot(2, 1));
    }

    #[test]
    fn test_commit_is_final() {
        let mut slot = SlotState::new();
        assert!(slot.commit(ballot(1, 1), b"x".to_vec()).expect("commit"));
        assert!(slot.is_committed());

        // Same value under a newer ballot only refreshes the ballot.
        assert!(!slot.commit(ballot(3, 2), b"x".to_vec()).expect("recommit"));
        assert_eq!(slot.committed_ballot(), Some(ballot(3, 2)));

        let err = slot
            .commit(ballot(4, 1), b"y".to_vec())
            .expect_err("conflicting commit");
        assert!(matches!(err, PaxosError::InvalidState(_)));
        assert_eq!(slot.committed_value(), Some(&b"x"[..]));
    }

    #[test]
    fn test_accept_on_committed_slot() {
        let mut slot = SlotState::new();
        slot.commit(ballot(1, 1), b"x".to_vec()).expect("commit");

        slot.accept(ballot(2, 1), b"x".to_vec())
            .expect("same value is acknowledged");
        assert!(slot.is_committed());

        assert!(slot.accept(ballot(3, 1), b"y".to_vec()).is_err());
        assert_eq!(slot.committed_value(), Some(&b"x"[..]));
    }
}
