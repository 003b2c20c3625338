//! Acceptor handlers.
//!
//! The acceptor is the "voter" in Paxos. In Raft terms, acceptors are
//! similar to **followers**: they store log entries and vote on proposals.
//! Every node is an acceptor for every index, including the ones it is
//! proposing itself.
//!
//! ## Handlers
//!
//! 1. **Prepare(index, b)**: grant iff `b` is strictly after the effective
//!    promise for `index`. Either way the reply carries the accepted
//!    `(ballot, value)` so the proposer can carry it forward.
//!    **Raft analogy**: a per-entry `RequestVote`.
//!
//! 2. **Propose(index, b, v)**: accept iff `b` is at least the effective
//!    promise. Equal is fine: that is the proposer that won the prepare.
//!    A value that contradicts a committed one is refused.
//!    **Raft analogy**: `AppendEntries` from a current-term leader.
//!
//! 3. **Commit(index, b, v)**: recorded without a ballot check. A commit is
//!    only sent after a propose quorum, so the sender is trusted. The only
//!    refusal is a commit that contradicts an already committed value.
//!
//! 4. **FullLogPrepare(b)**: grant iff `b` is strictly after the log-wide
//!    promise, and reply with a snapshot of the log from the candidate's
//!    first unapplied index.
//!
//! ## Key Invariant
//!
//! The effective promise of a slot never decreases. Handlers persist every
//! change before returning the reply, so a reply always describes durable
//! state.

use tracing::{debug, warn};

use crate::log::ReplicatedLog;
use crate::messages::{
    CommitRequest, CommitResponse, FullLogPrepareRequest, FullLogPrepareResponse, PrepareRequest,
    PrepareResponse, ProposeRequest, ProposeResponse,
};
use crate::slot::SlotState;
use crate::types::PaxosError;

/// Handle a single-index prepare.
pub fn on_prepare(
    log: &mut ReplicatedLog,
    request: &PrepareRequest,
) -> Result<PrepareResponse, PaxosError> {
    let index = request.index;
    let effective = log.effective_promise(index);
    let accepted = log.slot(index).and_then(SlotState::accepted);

    if !request.ballot.is_after(&effective) {
        debug!(
            ballot = %request.ballot,
            promised = %effective,
            index = %index,
            "refusing prepare"
        );
        return Ok(PrepareResponse {
            index,
            ballot: request.ballot,
            promised: false,
            promised_ballot: effective,
            accepted,
        });
    }

    log.update_slot(index, |slot| {
        slot.promise(request.ballot);
        Ok(())
    })?;

    debug!(
        ballot = %request.ballot,
        index = %index,
        has_accepted = accepted.is_some(),
        "promised"
    );

    Ok(PrepareResponse {
        index,
        ballot: request.ballot,
        promised: true,
        promised_ballot: request.ballot,
        accepted,
    })
}

/// Handle a single-index propose.
pub fn on_propose(
    log: &mut ReplicatedLog,
    request: &ProposeRequest,
) -> Result<ProposeResponse, PaxosError> {
    let index = request.index;
    let effective = log.effective_promise(index);

    if request.ballot < effective {
        warn!(
            ballot = %request.ballot,
            promised = %effective,
            index = %index,
            "rejecting propose with stale ballot"
        );
        return Ok(ProposeResponse {
            index,
            ballot: request.ballot,
            accepted: false,
            promised_ballot: effective,
        });
    }

    let conflicts = log
        .slot(index)
        .and_then(SlotState::committed_value)
        .is_some_and(|committed| committed != request.value.as_slice());
    if conflicts {
        warn!(
            ballot = %request.ballot,
            index = %index,
            "rejecting propose that conflicts with committed value"
        );
        return Ok(ProposeResponse {
            index,
            ballot: request.ballot,
            accepted: false,
            promised_ballot: effective,
        });
    }

    log.update_slot(index, |slot| {
        slot.accept(request.ballot, request.value.clone())
    })?;

    debug!(ballot = %request.ballot, index = %index, "accepted");

    Ok(ProposeResponse {
        index,
        ballot: request.ballot,
        accepted: true,
        promised_ballot: log.effective_promise(index),
    })
}

/// Handle a commit. Returns whether the index became committed just now.
///
/// The caller runs the apply engine afterwards.
pub fn on_commit(
    log: &mut ReplicatedLog,
    request: &CommitRequest,
) -> Result<(CommitResponse, bool), PaxosError> {
    let newly_committed = log.update_slot(request.index, |slot| {
        slot.commit(request.ballot, request.value.clone())
    })?;

    if newly_committed {
        debug!(ballot = %request.ballot, index = %request.index, "committed");
    }

    Ok((
        CommitResponse {
            index: request.index,
            success: true,
        },
        newly_committed,
    ))
}

/// Handle a full-log prepare.
pub fn on_full_log_prepare(
    log: &mut ReplicatedLog,
    request: &FullLogPrepareRequest,
) -> Result<FullLogPrepareResponse, PaxosError> {
    let promised = log.promised();
    if !request.ballot.is_after(&promised) {
        debug!(
            ballot = %request.ballot,
            promised = %promised,
            "refusing full-log prepare"
        );
        return Ok(FullLogPrepareResponse {
            ballot: request.ballot,
            promised: false,
            promised_ballot: promised,
            ..Default::default()
        });
    }

    log.raise_promise(request.ballot)?;

    let mut response = FullLogPrepareResponse {
        ballot: request.ballot,
        promised: true,
        promised_ballot: request.ballot,
        highest_index: log.highest_index(),
        ..Default::default()
    };
    for (index, slot) in log.slots().range(request.from_index..) {
        let Some(accepted) = slot.accepted() else {
            continue;
        };
        if slot.is_committed() {
            response.committed.insert(*index, accepted);
        } else {
            response.uncommitted.insert(*index, accepted);
        }
    }

    debug!(
        ballot = %request.ballot,
        uncommitted = response.uncommitted.len(),
        committed = response.committed.len(),
        "promised full log"
    );

    Ok(response)
}
