//! The replicated log: index → [`SlotState`], plus the applied watermark.
//!
//! [`ReplicatedLog`] is owned by a single node actor and is the only path
//! through which slot state changes. Every mutation is written through to
//! the [`PaxosStorage`] before the in-memory copy is updated, so nothing is
//! acknowledged that is not durable.
//!
//! Two promises guard each index:
//!
//! - the **per-slot** promise, raised by single-index prepare and propose;
//! - the **log-wide** promise, raised by full-log prepare and heartbeats.
//!
//! Ballot checks use the [effective promise](ReplicatedLog::effective_promise),
//! the maximum of the two.

use std::collections::BTreeMap;

use crate::slot::SlotState;
use crate::storage::PaxosStorage;
use crate::types::{Ballot, LogIndex, PaxosError};

/// Ordered map of slot states backed by a durable log.
pub struct ReplicatedLog {
    slots: BTreeMap<LogIndex, SlotState>,
    promised: Ballot,
    applied_up_to: Option<LogIndex>,
    storage: Box<dyn PaxosStorage>,
}

impl std::fmt::Debug for ReplicatedLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedLog")
            .field("slots", &self.slots.len())
            .field("promised", &self.promised)
            .field("applied_up_to", &self.applied_up_to)
            .finish()
    }
}

impl ReplicatedLog {
    /// Rebuild the log from whatever `storage` holds.
    ///
    /// Nothing is considered applied: the state machine is rebuilt by
    /// replaying the committed prefix.
    pub fn open(storage: Box<dyn PaxosStorage>) -> Result<Self, PaxosError> {
        let promised = storage.load_promised()?;
        let slots = storage.load_all()?.into_iter().collect();
        Ok(Self {
            slots,
            promised,
            applied_up_to: None,
            storage,
        })
    }

    /// State of `index`, if it was ever touched.
    pub fn slot(&self, index: LogIndex) -> Option<&SlotState> {
        self.slots.get(&index)
    }

    /// All touched indices in ascending order.
    pub fn slots(&self) -> &BTreeMap<LogIndex, SlotState> {
        &self.slots
    }

    /// The log-wide promise.
    pub fn promised(&self) -> Ballot {
        self.promised
    }

    /// The ballot a request for `index` must beat.
    pub fn effective_promise(&self, index: LogIndex) -> Ballot {
        let slot = self
            .slots
            .get(&index)
            .map(SlotState::promised)
            .unwrap_or(Ballot::EMPTY);
        slot.max(self.promised)
    }

    /// Raise the log-wide promise. Lower ballots are ignored.
    pub fn raise_promise(&mut self, ballot: Ballot) -> Result<(), PaxosError> {
        if ballot.is_after(&self.promised) {
            self.storage.store_promised(ballot)?;
            self.promised = ballot;
        }
        Ok(())
    }

    /// Apply `f` to the state of `index`, creating it lazily, and persist
    /// the result.
    ///
    /// If `f` fails, neither memory nor storage is touched.
    pub fn update_slot<R>(
        &mut self,
        index: LogIndex,
        f: impl FnOnce(&mut SlotState) -> Result<R, PaxosError>,
    ) -> Result<R, PaxosError> {
        let mut slot = self.slots.get(&index).cloned().unwrap_or_default();
        let result = f(&mut slot)?;
        self.storage.store_slot(index, &slot)?;
        self.slots.insert(index, slot);
        Ok(result)
    }

    /// Highest touched index.
    pub fn highest_index(&self) -> Option<LogIndex> {
        self.slots.keys().next_back().copied()
    }

    /// First index never touched past the end of the log.
    pub fn next_free_index(&self) -> LogIndex {
        self.highest_index()
            .map(LogIndex::next)
            .unwrap_or(LogIndex::FIRST)
    }

    /// Highest contiguously applied index.
    pub fn applied_up_to(&self) -> Option<LogIndex> {
        self.applied_up_to
    }

    /// The next index the state machine is waiting for.
    pub fn first_unapplied(&self) -> LogIndex {
        self.applied_up_to
            .map(LogIndex::next)
            .unwrap_or(LogIndex::FIRST)
    }

    /// The committed value at the first unapplied index, if any.
    pub fn next_to_apply(&self) -> Option<(LogIndex, Vec<u8>)> {
        let index = self.first_unapplied();
        self.slots
            .get(&index)
            .and_then(SlotState::committed_value)
            .map(|value| (index, value.to_vec()))
    }

    /// Advance the watermark past `index`.
    ///
    /// `index` must be the first unapplied index and must be committed.
    pub fn mark_applied(&mut self, index: LogIndex) -> Result<(), PaxosError> {
        if index != self.first_unapplied() {
            return Err(PaxosError::InvalidState(format!(
                "cannot apply {index} before {}",
                self.first_unapplied()
            )));
        }
        if !self.slots.get(&index).is_some_and(SlotState::is_committed) {
            return Err(PaxosError::InvalidState(format!(
                "cannot apply uncommitted {index}"
            )));
        }
        self.applied_up_to = Some(index);
        Ok(())
    }
}
