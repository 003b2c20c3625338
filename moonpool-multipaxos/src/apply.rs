//! In-order application of committed entries.
//!
//! Commits may arrive in any order; the state machine must see them in
//! index order. [`ApplyEngine::drain`] applies the committed run that starts
//! at the log's first unapplied index and stops at the first gap:
//!
//! ```text
//!   applied_up_to
//!        │
//!   [0] [1] [2] [3] [4]
//!    C   C   ·   C   C      · = not committed yet
//!            ▲
//!            └─ drain stops here; 3 and 4 wait for 2
//! ```
//!
//! Each applied record resolves the client waiter registered for its
//! [`RequestId`]. A record committed at two indices (an abandoned attempt
//! carried forward by another proposer, plus the client's retry) is applied
//! once; the second index is skipped.
//!
//! Applied ids are tracked per `(node, incarnation)` as a contiguous
//! sequence watermark plus the sparse sequences above it, so the tracker
//! only grows with requests that were abandoned without ever committing.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::kv::{CommandResult, LogRecord, RequestId, StateMachine};
use crate::log::ReplicatedLog;
use crate::types::{LogIndex, NodeId, PaxosError};

/// Reply channel of a client waiting for its command to be applied.
pub type ApplyWaiter = oneshot::Sender<Result<CommandResult, PaxosError>>;

/// Sequences applied for one `(node, incarnation)`.
#[derive(Debug, Default)]
struct AppliedSequences {
    /// Sequences `1..=floor` are all applied.
    floor: u64,
    /// Applied sequences outside the contiguous run.
    sparse: BTreeSet<u64>,
}

impl AppliedSequences {
    fn contains(&self, sequence: u64) -> bool {
        (1..=self.floor).contains(&sequence) || self.sparse.contains(&sequence)
    }

    /// Record `sequence`. Returns `false` if it was already applied.
    fn insert(&mut self, sequence: u64) -> bool {
        if self.contains(sequence) {
            return false;
        }
        if sequence == self.floor + 1 {
            self.floor = sequence;
            while self.sparse.remove(&(self.floor + 1)) {
                self.floor += 1;
            }
        } else {
            self.sparse.insert(sequence);
        }
        true
    }
}

/// Applies committed records and resolves client waiters.
pub struct ApplyEngine {
    state_machine: Box<dyn StateMachine>,
    waiters: HashMap<RequestId, ApplyWaiter>,
    applied: HashMap<(NodeId, u64), AppliedSequences>,
}

impl ApplyEngine {
    /// Engine over `state_machine`, which must reflect nothing applied yet.
    pub fn new(state_machine: Box<dyn StateMachine>) -> Self {
        Self {
            state_machine,
            waiters: HashMap::new(),
            applied: HashMap::new(),
        }
    }

    /// Whether the record `id` has been applied.
    pub fn is_applied(&self, id: &RequestId) -> bool {
        self.applied
            .get(&(id.node, id.incarnation))
            .is_some_and(|sequences| sequences.contains(id.sequence))
    }

    /// Wait for the record `id` to be applied.
    ///
    /// Fails at once if it already was: its result went to the first waiter.
    pub fn register(&mut self, id: RequestId, waiter: ApplyWaiter) {
        if self.is_applied(&id) {
            let _ = waiter.send(Err(PaxosError::InvalidState(format!(
                "request {} of {} already applied",
                id.sequence, id.node
            ))));
            return;
        }
        self.waiters.insert(id, waiter);
    }

    /// Stop waiting for `id`.
    pub fn cancel(&mut self, id: RequestId) -> Option<ApplyWaiter> {
        self.waiters.remove(&id)
    }

    /// Read from the state machine.
    pub fn get(&self, key: &str) -> Option<String> {
        self.state_machine.get(key)
    }

    /// Number of clients waiting.
    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    /// Apply every committed index from the first unapplied one up to the
    /// first gap. Returns the indices applied, in order.
    pub fn drain(&mut self, log: &mut ReplicatedLog) -> Result<Vec<LogIndex>, PaxosError> {
        let mut applied = Vec::new();
        while let Some((index, value)) = log.next_to_apply() {
            self.apply_at(index, &value);
            log.mark_applied(index)?;
            applied.push(index);
        }
        Ok(applied)
    }

    fn apply_at(&mut self, index: LogIndex, value: &[u8]) {
        let record = match LogRecord::decode(value) {
            Ok(record) => record,
            Err(err) => {
                // Every node skips the same bytes, so replicas stay identical.
                warn!(index = %index, error = %err, "skipping undecodable log record");
                return;
            }
        };

        let first_time = self
            .applied
            .entry((record.id.node, record.id.incarnation))
            .or_default()
            .insert(record.id.sequence);
        if !first_time {
            debug!(
                index = %index,
                sequence = record.id.sequence,
                "record already applied, skipping"
            );
            return;
        }

        let result = self.state_machine.apply(&record.command);
        if let Some(waiter) = self.waiters.remove(&record.id) {
            let _ = waiter.send(Ok(result));
        }
    }

    /// Fail every waiter, e.g. on shutdown.
    pub fn fail_all(&mut self, error: PaxosError) {
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::kv::{Command, KvStore};
    use crate::storage::InMemoryPaxosStorage;
    use crate::types::{Ballot, NodeId};

    /// Records every command it sees, in order.
    struct Recorder(Rc<RefCell<Vec<Command>>>);

    impl StateMachine for Recorder {
        fn apply(&mut self, command: &Command) -> CommandResult {
            self.0.borrow_mut().push(command.clone());
            CommandResult {
                value: None,
                success: true,
            }
        }

        fn get(&self, _key: &str) -> Option<String> {
            None
        }
    }

    fn make_log() -> ReplicatedLog {
        ReplicatedLog::open(Box::new(InMemoryPaxosStorage::new())).expect("open")
    }

    fn record(sequence: u64, key: &str) -> LogRecord {
        LogRecord {
            id: RequestId {
                node: NodeId(1),
                incarnation: 7,
                sequence,
            },
            command: Command::Set {
                key: key.to_string(),
                value: sequence.to_string(),
            },
        }
    }

    fn commit(log: &mut ReplicatedLog, index: u64, record: &LogRecord) {
        let value = record.encode().expect("encode");
        log.update_slot(LogIndex::new(index), |slot| {
            slot.commit(Ballot::new(1, NodeId(1)), value).map(|_| ())
        })
        .expect("commit");
    }

    #[test]
    fn test_out_of_order_commits_apply_in_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut engine = ApplyEngine::new(Box::new(Recorder(seen.clone())));
        let mut log = make_log();

        commit(&mut log, 0, &record(0, "a"));
        assert_eq!(engine.drain(&mut log).expect("drain"), vec![LogIndex::new(0)]);

        // Index 2 first: buffered behind the gap at 1.
        commit(&mut log, 2, &record(2, "c"));
        assert!(engine.drain(&mut log).expect("drain").is_empty());
        assert_eq!(log.applied_up_to(), Some(LogIndex::new(0)));

        // Index 1 closes the gap: 1 then 2.
        commit(&mut log, 1, &record(1, "b"));
        assert_eq!(
            engine.drain(&mut log).expect("drain"),
            vec![LogIndex::new(1), LogIndex::new(2)]
        );

        let keys: Vec<String> = seen
            .borrow()
            .iter()
            .map(|c| match c {
                Command::Set { key, .. } => key.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_drain_is_idempotent() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut engine = ApplyEngine::new(Box::new(Recorder(seen.clone())));
        let mut log = make_log();

        commit(&mut log, 0, &record(0, "a"));
        engine.drain(&mut log).expect("drain");
        assert!(engine.drain(&mut log).expect("drain").is_empty());
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_waiter_resolved_on_apply() {
        let mut engine = ApplyEngine::new(Box::new(KvStore::new()));
        let mut log = make_log();
        let rec = record(3, "x");

        let (tx, mut rx) = oneshot::channel();
        engine.register(rec.id, tx);
        assert_eq!(engine.waiting(), 1);

        commit(&mut log, 0, &rec);
        engine.drain(&mut log).expect("drain");

        let result = rx.try_recv().expect("resolved").expect("applied");
        assert_eq!(result.value.as_deref(), Some("3"));
        assert_eq!(engine.get("x").as_deref(), Some("3"));
        assert_eq!(engine.waiting(), 0);
    }

    #[test]
    fn test_duplicate_record_applied_once() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut engine = ApplyEngine::new(Box::new(Recorder(seen.clone())));
        let mut log = make_log();
        let rec = record(1, "dup");

        commit(&mut log, 0, &rec);
        commit(&mut log, 1, &rec);
        engine.drain(&mut log).expect("drain");
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(log.applied_up_to(), Some(LogIndex::new(1)));

        assert!(engine.is_applied(&rec.id));

        // Registering after the fact fails immediately.
        let (tx, mut rx) = oneshot::channel();
        engine.register(rec.id, tx);
        assert!(rx.try_recv().expect("resolved").is_err());
        assert_eq!(engine.waiting(), 0);
    }

    #[test]
    fn test_applied_sequences_collapse_into_watermark() {
        let mut applied = AppliedSequences::default();
        assert!(applied.insert(1));
        assert!(applied.insert(3));
        assert!(applied.insert(4));
        assert_eq!(applied.floor, 1);
        assert_eq!(applied.sparse.len(), 2);

        assert!(applied.insert(2));
        assert_eq!(applied.floor, 4);
        assert!(applied.sparse.is_empty());

        assert!(!applied.insert(3));
        assert!(applied.contains(4));
        assert!(!applied.contains(5));
    }

    #[test]
    fn test_sequence_zero_is_tracked() {
        let mut applied = AppliedSequences::default();
        assert!(!applied.contains(0));
        assert!(applied.insert(0));
        assert!(!applied.insert(0));
        assert_eq!(applied.floor, 0);
    }

    #[test]
    fn test_undecodable_record_is_skipped() {
        let mut engine = ApplyEngine::new(Box::new(KvStore::new()));
        let mut log = make_log();
        log.update_slot(LogIndex::new(0), |slot| {
            slot.commit(Ballot::new(1, NodeId(1)), b"garbage".to_vec())
                .map(|_| ())
        })
        .expect("commit");
        commit(&mut log, 1, &record(1, "after"));

        let applied = engine.drain(&mut log).expect("drain");
        assert_eq!(applied.len(), 2);
        assert_eq!(engine.get("after").as_deref(), Some("1"));
    }

    #[test]
    fn test_fail_all_releases_waiters() {
        let mut engine = ApplyEngine::new(Box::new(KvStore::new()));
        let (tx, mut rx) = oneshot::channel();
        engine.register(record(0, "x").id, tx);
        engine.fail_all(PaxosError::Shutdown);

        assert_eq!(
            rx.try_recv().expect("resolved"),
            Err(PaxosError::Shutdown)
        );
    }
}
