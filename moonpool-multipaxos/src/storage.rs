//! Durable log trait and in-memory implementation.
//!
//! The [`PaxosStorage`] trait abstracts the state an acceptor must persist
//! before acknowledging anything. In a real deployment this would be backed
//! by a write-ahead log. For simulation testing, [`InMemoryPaxosStorage`]
//! keeps everything in a `BTreeMap`.
//!
//! ## What gets stored?
//!
//! - **promised**: The log-wide promise made by full-log prepare and
//!   heartbeats. In Raft terms, this is like the persisted `currentTerm`.
//! - **slots**: The full [`SlotState`] of every index touched so far
//!   (per-index promise plus phase). In Raft terms, this is `log[]`.
//!
//! Log compaction is out of scope: slots are never deleted.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::slot::SlotState;
use crate::types::{Ballot, LogIndex, PaxosError};

/// Trait for persistent Paxos state.
///
/// Implementations must ensure that writes are durable before returning
/// (in a real system, this means fsync). The replicated log writes through
/// this trait before any reply leaves the node.
pub trait PaxosStorage {
    /// Load the log-wide promised ballot.
    ///
    /// Returns `Ballot::EMPTY` if nothing has been promised yet.
    fn load_promised(&self) -> Result<Ballot, PaxosError>;

    /// Store the log-wide promised ballot.
    fn store_promised(&mut self, ballot: Ballot) -> Result<(), PaxosError>;

    /// Read the state of a single index.
    fn load_slot(&self, index: LogIndex) -> Result<Option<SlotState>, PaxosError>;

    /// Write (append or overwrite) the state of a single index.
    fn store_slot(&mut self, index: LogIndex, slot: &SlotState) -> Result<(), PaxosError>;

    /// Read every stored index in ascending order.
    ///
    /// Used on startup to rebuild the in-memory log.
    fn load_all(&self) -> Result<Vec<(LogIndex, SlotState)>, PaxosError>;

    /// Highest index with stored state, `None` for an empty log.
    fn highest_index(&self) -> Result<Option<LogIndex>, PaxosError>;
}

/// Shared handle, so a simulated "disk" can outlive the node that writes it.
impl<S: PaxosStorage + ?Sized> PaxosStorage for Rc<RefCell<S>> {
    fn load_promised(&self) -> Result<Ballot, PaxosError> {
        self.borrow().load_promised()
    }

    fn store_promised(&mut self, ballot: Ballot) -> Result<(), PaxosError> {
        self.borrow_mut().store_promised(ballot)
    }

    fn load_slot(&self, index: LogIndex) -> Result<Option<SlotState>, PaxosError> {
        self.borrow().load_slot(index)
    }

    fn store_slot(&mut self, index: LogIndex, slot: &SlotState) -> Result<(), PaxosError> {
        self.borrow_mut().store_slot(index, slot)
    }

    fn load_all(&self) -> Result<Vec<(LogIndex, SlotState)>, PaxosError> {
        self.borrow().load_all()
    }

    fn highest_index(&self) -> Result<Option<LogIndex>, PaxosError> {
        self.borrow().highest_index()
    }
}

/// In-memory implementation of [`PaxosStorage`].
///
/// Suitable for simulation testing. Wrap it in `Rc<RefCell<_>>` to keep the
/// state across a simulated crash and restart.
#[derive(Debug, Default)]
pub struct InMemoryPaxosStorage {
    promised: Ballot,
    slots: BTreeMap<LogIndex, SlotState>,
}

impl InMemoryPaxosStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PaxosStorage for InMemoryPaxosStorage {
    fn load_promised(&self) -> Result<Ballot, PaxosError> {
        Ok(self.promised)
    }

    fn store_promised(&mut self, ballot: Ballot) -> Result<(), PaxosError> {
        self.promised = ballot;
        Ok(())
    }

    fn load_slot(&self, index: LogIndex) -> Result<Option<SlotState>, PaxosError> {
        Ok(self.slots.get(&index).cloned())
    }

    fn store_slot(&mut self, index: LogIndex, slot: &SlotState) -> Result<(), PaxosError> {
        self.slots.insert(index, slot.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<(LogIndex, SlotState)>, PaxosError> {
        Ok(self
            .slots
            .iter()
            .map(|(index, slot)| (*index, slot.clone()))
            .collect())
    }

    fn highest_index(&self) -> Result<Option<LogIndex>, PaxosError> {
        Ok(self.slots.keys().next_back().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    #[test]
    fn test_initial_state() {
        let storage = InMemoryPaxosStorage::new();

        assert_eq!(storage.load_promised().expect("load"), Ballot::EMPTY);
        assert!(storage.highest_index().expect("highest").is_none());
        assert!(storage.load_slot(LogIndex::FIRST).expect("load").is_none());
    }

    #[test]
    fn test_store_and_load_promised() {
        let mut storage = InMemoryPaxosStorage::new();

        storage
            .store_promised(Ballot::new(5, NodeId(1)))
            .expect("store");
        assert_eq!(
            storage.load_promised().expect("load"),
            Ballot::new(5, NodeId(1))
        );
    }

    #[test]
    fn test_store_slot_overwrites() {
        let mut storage = InMemoryPaxosStorage::new();

        let mut slot = SlotState::new();
        slot.accept(Ballot::new(1, NodeId(1)), b"first".to_vec())
            .expect("accept");
        storage.store_slot(LogIndex::new(0), &slot).expect("store");

        slot.accept(Ballot::new(2, NodeId(2)), b"second".to_vec())
            .expect("accept");
        storage.store_slot(LogIndex::new(0), &slot).expect("store");

        let loaded = storage
            .load_slot(LogIndex::new(0))
            .expect("load")
            .expect("should exist");
        assert_eq!(loaded, slot);
    }

    #[test]
    fn test_load_all_is_ordered() {
        let mut storage = InMemoryPaxosStorage::new();

        for i in [7, 3, 5] {
            storage
                .store_slot(LogIndex::new(i), &SlotState::new())
                .expect("store");
        }

        let indices: Vec<_> = storage
            .load_all()
            .expect("load")
            .into_iter()
            .map(|(index, _)| index.0)
            .collect();
        assert_eq!(indices, vec![3, 5, 7]);
        assert_eq!(
            storage.highest_index().expect("highest"),
            Some(LogIndex::new(7))
        );
    }

    #[test]
    fn test_shared_handle_survives_owner() {
        let disk = Rc::new(RefCell::new(InMemoryPaxosStorage::new()));
        {
            let mut owner: Box<dyn PaxosStorage> = Box::new(disk.clone());
            owner
                .store_promised(Ballot::new(2, NodeId(3)))
                .expect("store");
        }
        assert_eq!(
            disk.load_promised().expect("load"),
            Ballot::new(2, NodeId(3))
        );
    }
}
