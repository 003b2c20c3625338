//! Leader election by full-log prepare.
//!
//! In Raft terms this is `RequestVote` plus log reconciliation in one step.
//! The candidate asks every member to promise its fresh ballot for the whole
//! log. Each promise carries a snapshot of the acceptor's log from the
//! candidate's first unapplied index on. Once a majority has promised:
//!
//! ```text
//! 1. merge the snapshots (committed entries win, else highest ballot)
//! 2. become Leader, not yet ready
//! 3. re-propose every index from first_unapplied to the highest seen:
//!      committed value → re-commit it
//!      accepted value  → finish it
//!      nothing         → no-op
//! 4. leader ready: serve appends from the first free index
//! ```
//!
//! Step 3 runs without per-index prepares, the majority's log-wide promise
//! covers them. A higher ballot seen at any point sends the candidate back
//! to follower.

use std::collections::BTreeMap;
use std::rc::Rc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::config::ProposalMode;
use crate::kv::{Command, LogRecord};
use crate::messages::{AcceptedValue, FullLogPrepareRequest, FullLogPrepareResponse, PeerMessage};
use crate::node::{NodeContext, NodeRole};
use crate::proposer::{run_round, RoundStart};
use crate::types::{Ballot, LogIndex, PaxosError};

/// Union of a majority's log snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedLog {
    /// Entries some acceptor reported committed.
    pub committed: BTreeMap<LogIndex, AcceptedValue>,
    /// Highest-ballot accepted value of every other reported index.
    pub uncommitted: BTreeMap<LogIndex, AcceptedValue>,
    /// Highest index any acceptor has touched.
    pub highest_index: Option<LogIndex>,
}

/// Merge full-log prepare snapshots.
pub fn merge_snapshots(snapshots: impl IntoIterator<Item = FullLogPrepareResponse>) -> MergedLog {
    let mut merged = MergedLog::default();
    for snapshot in snapshots {
        merged.highest_index = merged.highest_index.max(snapshot.highest_index);
        for (index, entry) in snapshot.committed {
            merged.committed.entry(index).or_insert(entry);
        }
        for (index, entry) in snapshot.uncommitted {
            match merged.uncommitted.get(&index) {
                Some(existing) if !entry.ballot.is_after(&existing.ballot) => {}
                _ => {
                    merged.uncommitted.insert(index, entry);
                }
            }
        }
    }
    let committed = &merged.committed;
    merged
        .uncommitted
        .retain(|index, _| !committed.contains_key(index));
    merged
}

/// Campaign for leadership. Returns the ballot once the node is a ready
/// leader.
pub(crate) async fn run_election(ctx: &Rc<NodeContext>) -> Result<Ballot, PaxosError> {
    if ctx.config.mode != ProposalMode::LeaderBased {
        return Err(PaxosError::InvalidConfig(
            "elections need leader-based mode".to_string(),
        ));
    }
    ctx.ensure_running()?;

    let (ballot, from_index) = begin(ctx)?;
    info!(node = %ctx.id, ballot = %ballot, from_index = %from_index, "starting election");

    let result = recover(ctx, ballot, from_index).await;
    finish(ctx, ballot, &result);
    result.map(|()| ballot)
}

fn begin(ctx: &NodeContext) -> Result<(Ballot, LogIndex), PaxosError> {
    let now = ctx.now();
    let mut state = ctx.state.borrow_mut();
    if state.election_in_flight {
        return Err(PaxosError::InvalidState(
            "election already in progress".to_string(),
        ));
    }
    let ballot = state.fresh_ballot(ctx.id);
    state.role = NodeRole::Candidate;
    state.ballot = ballot;
    state.leader_ready = false;
    state.known_leader = None;
    state.election_in_flight = true;
    state.reset_election_timer(now);
    Ok((ballot, state.log.first_unapplied()))
}

async fn recover(
    ctx: &Rc<NodeContext>,
    ballot: Ballot,
    from_index: LogIndex,
) -> Result<(), PaxosError> {
    let replies = ctx
        .broadcast(
            PeerMessage::FullLogPrepare(FullLogPrepareRequest { ballot, from_index }),
            |r: &FullLogPrepareResponse| r.promised,
        )
        .await
        .map_err(|failure| failure.into_error(ballot))?;
    let merged = merge_snapshots(replies.into_iter().map(|(_, reply)| reply));

    let plan = {
        let mut guard = ctx.state.borrow_mut();
        let state = &mut *guard;
        if state.role != NodeRole::Candidate || state.ballot != ballot {
            return Err(PaxosError::InvalidState(format!(
                "{ballot} superseded during election"
            )));
        }
        state.role = NodeRole::Leader;
        state.known_leader = Some(ctx.id);

        let highest = merged.highest_index.max(state.log.highest_index());
        let mut plan = Vec::new();
        if let Some(highest) = highest {
            for n in from_index.0..=highest.0 {
                let index = LogIndex::new(n);
                let known = merged
                    .committed
                    .get(&index)
                    .or_else(|| merged.uncommitted.get(&index))
                    .map(|entry| entry.value.clone())
                    .or_else(|| {
                        state
                            .log
                            .slot(index)
                            .and_then(|slot| slot.accepted())
                            .map(|entry| entry.value)
                    });
                let value = match known {
                    Some(value) => value,
                    None => LogRecord {
                        id: state.next_request_id(ctx.id),
                        command: Command::NoOp,
                    }
                    .encode()?,
                };
                plan.push((index, value));
            }
        }
        plan
    };

    let recovered = plan.len();
    info!(node = %ctx.id, ballot = %ballot, recovered, "elected, recovering log");

    let rounds = plan
        .into_iter()
        .map(|(index, value)| run_round(ctx, index, ballot, value, RoundStart::Prepared));
    for outcome in join_all(rounds).await {
        outcome?;
    }

    let mut state = ctx.state.borrow_mut();
    if state.role != NodeRole::Leader || state.ballot != ballot {
        return Err(PaxosError::InvalidState(format!(
            "{ballot} superseded during recovery"
        )));
    }
    let after_recovered = merged
        .highest_index
        .map(LogIndex::next)
        .unwrap_or(LogIndex::FIRST);
    state.next_index = after_recovered
        .max(state.log.next_free_index())
        .max(from_index);
    state.leader_ready = true;
    state.last_heartbeat_sent = None;
    info!(
        node = %ctx.id,
        ballot = %ballot,
        next_index = %state.next_index,
        "leader ready"
    );
    Ok(())
}

fn finish(ctx: &NodeContext, ballot: Ballot, result: &Result<(), PaxosError>) {
    let now = ctx.now();
    let mut state = ctx.state.borrow_mut();
    state.election_in_flight = false;
    if let Err(err) = result {
        warn!(node = %ctx.id, ballot = %ballot, error = %err, "election failed");
        if state.ballot == ballot && state.role != NodeRole::Follower {
            state.become_follower(None, now);
        }
    }
}
