//! Invariant checkers for multi-Paxos simulation tests.
//!
//! ## Safety Properties
//!
//! These must NEVER be violated, regardless of faults:
//!
//! 1. **Agreement**: No two nodes hold different committed values at the
//!    same index. In Raft terms: no two different entries committed at the
//!    same log index.
//!
//! 2. **Validity**: Every committed value is a record some client proposed,
//!    or a no-op.
//!
//! 3. **Sequential application**: Every index up to a node's apply cursor is
//!    committed on that node.
//!
//! 4. **Promise monotonicity**: A node's log-wide promise never goes down,
//!    across restarts included.

use std::collections::BTreeMap;

use moonpool_multipaxos::{Ballot, Command, LogIndex, LogRecord, NodeId, NodeStatus};

// ============================================================================
// Safety Invariant Checkers
// ============================================================================

/// Assert that every committed index holds one value cluster-wide.
///
/// Ballots may differ: a value re-committed by a later leader carries the
/// later ballot on the nodes that saw the re-commit.
pub fn check_agreement(statuses: &[NodeStatus]) {
    let mut chosen: BTreeMap<LogIndex, (NodeId, &[u8])> = BTreeMap::new();
    for status in statuses {
        for (index, value) in status.committed() {
            match chosen.get(&index) {
                Some((first, existing)) => assert_eq!(
                    *existing, value,
                    "SAFETY VIOLATION: {} and {} committed different values at {}",
                    first, status.id, index
                ),
                None => {
                    chosen.insert(index, (status.id, value));
                }
            }
        }
    }
}

/// Assert that every committed value decodes to a no-op or one of `proposed`.
pub fn check_validity(statuses: &[NodeStatus], proposed: &[Command]) {
    for status in statuses {
        for (index, value) in status.committed() {
            let record = LogRecord::decode(value).unwrap_or_else(|e| {
                panic!("SAFETY VIOLATION: {} holds undecodable value at {index}: {e}", status.id)
            });
            assert!(
                record.command == Command::NoOp || proposed.contains(&record.command),
                "SAFETY VIOLATION: {} committed unproposed {:?} at {}",
                status.id,
                record.command,
                index
            );
        }
    }
}

/// Assert that nothing was applied past a hole.
pub fn check_sequential_application(statuses: &[NodeStatus]) {
    for status in statuses {
        let Some(applied) = status.applied_up_to else {
            continue;
        };
        for n in 0..=applied.0 {
            let index = LogIndex::new(n);
            assert!(
                status.committed_value(index).is_some(),
                "SAFETY VIOLATION: {} applied up to {} but {} is not committed",
                status.id,
                applied,
                index
            );
        }
    }
}

/// Assert that no node's promise went down between two snapshots.
pub fn check_promise_monotonic(before: &[NodeStatus], after: &[NodeStatus]) {
    let earlier: BTreeMap<NodeId, Ballot> = before.iter().map(|s| (s.id, s.promised)).collect();
    for status in after {
        if let Some(previous) = earlier.get(&status.id) {
            assert!(
                status.promised >= *previous,
                "SAFETY VIOLATION: {} promise went from {} down to {}",
                status.id,
                previous,
                status.promised
            );
        }
    }
}

/// Run every stateless check.
pub fn check_all(statuses: &[NodeStatus], proposed: &[Command]) {
    check_agreement(statuses);
    check_validity(statuses, proposed);
    check_sequential_application(statuses);
}
