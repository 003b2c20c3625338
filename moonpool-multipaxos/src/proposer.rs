//! Proposer: drives one Paxos round per log index.
//!
//! ## Round Flow
//!
//! ```text
//! Proposer                                   Acceptors (all members)
//!   │── Prepare(index, ballot) ─────────────────>│   leaderless only
//!   │<── PrepareResponse(promised, accepted?) ───│   majority
//!   │   value = highest accepted, else own       │
//!   │── Propose(index, ballot, value) ──────────>│
//!   │<── ProposeResponse(accepted) ──────────────│   majority → chosen
//!   │── Commit(index, ballot, value) ───────────>│   apply in index order
//! ```
//!
//! A ready leader skips the prepare: its ballot was promised for the whole
//! log when it won the election.
//!
//! If the prepare uncovers someone else's value, the round finishes that
//! value and the append moves on to the next index. Failed rounds are
//! retried with jittered backoff up to the configured attempt budget, and
//! the index they leave behind is later filled with a no-op so that apply
//! never stalls on it.

use std::rc::Rc;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::ProposalMode;
use crate::kv::{Command, CommandResult, LogRecord};
use crate::messages::{
    CommitRequest, CommitResponse, PeerMessage, PrepareRequest, PrepareResponse, ProposeRequest,
    ProposeResponse,
};
use crate::node::{noop_record, NodeContext, NodeRole};
use crate::types::{Ballot, LogIndex, PaxosError};

/// Whether a round must run its own prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RoundStart {
    /// Run prepare for this index under a fresh ballot.
    Prepare,
    /// The ballot is already promised for the whole log.
    Prepared,
}

/// A value chosen at an index.
#[derive(Debug, Clone)]
pub(crate) struct RoundOutcome {
    pub(crate) index: LogIndex,
    pub(crate) ballot: Ballot,
    pub(crate) value: Vec<u8>,
    /// Whether the chosen value is the one the round was started with.
    pub(crate) own_value: bool,
}

/// The value a proposer must propose after a successful prepare.
pub(crate) fn choose_value(
    replies: impl IntoIterator<Item = PrepareResponse>,
    initial: Vec<u8>,
) -> Vec<u8> {
    replies
        .into_iter()
        .filter_map(|reply| reply.accepted)
        .max_by_key(|accepted| accepted.ballot)
        .map(|accepted| accepted.value)
        .unwrap_or(initial)
}

/// Run one round at `index` under `ballot`, proposing `initial` unless the
/// prepare reveals an accepted value.
pub(crate) async fn run_round(
    ctx: &Rc<NodeContext>,
    index: LogIndex,
    ballot: Ballot,
    initial: Vec<u8>,
    start: RoundStart,
) -> Result<RoundOutcome, PaxosError> {
    let value = match start {
        RoundStart::Prepare => {
            let replies = ctx
                .broadcast(
                    PeerMessage::Prepare(PrepareRequest { index, ballot }),
                    |r: &PrepareResponse| r.promised,
                )
                .await
                .map_err(|failure| failure.into_error(ballot))?;
            choose_value(replies.into_iter().map(|(_, reply)| reply), initial.clone())
        }
        RoundStart::Prepared => initial.clone(),
    };

    ctx.broadcast(
        PeerMessage::Propose(ProposeRequest {
            index,
            ballot,
            value: value.clone(),
        }),
        |r: &ProposeResponse| r.accepted,
    )
    .await
    .map_err(|failure| failure.into_error(ballot))?;

    debug!(node = %ctx.id, index = %index, ballot = %ballot, "value chosen");

    // The value is chosen; commit delivery only affects how soon peers learn it.
    if let Err(failure) = ctx
        .broadcast(
            PeerMessage::Commit(CommitRequest {
                index,
                ballot,
                value: value.clone(),
            }),
            |r: &CommitResponse| r.success,
        )
        .await
    {
        warn!(
            node = %ctx.id,
            index = %index,
            got = failure.got,
            needed = failure.needed,
            "commit not acknowledged by a majority"
        );
    }

    let own_value = value == initial;
    Ok(RoundOutcome {
        index,
        ballot,
        value,
        own_value,
    })
}

/// Pick the index, ballot and starting phase of the next append attempt.
fn reserve_slot(ctx: &NodeContext) -> Result<(LogIndex, Ballot, RoundStart), PaxosError> {
    let mut state = ctx.state.borrow_mut();
    let index = state.next_index.max(state.log.next_free_index());
    match ctx.config.mode {
        ProposalMode::Leaderless => {
            state.next_index = index.next();
            let ballot = state.fresh_ballot(ctx.id);
            Ok((index, ballot, RoundStart::Prepare))
        }
        ProposalMode::LeaderBased => {
            if state.role != NodeRole::Leader || !state.leader_ready {
                return Err(PaxosError::NotLeader {
                    leader: state.known_leader,
                });
            }
            state.next_index = index.next();
            Ok((index, state.ballot, RoundStart::Prepared))
        }
    }
}

/// Append `value` to the log and return the index it was chosen at.
pub(crate) async fn append(ctx: &Rc<NodeContext>, value: Vec<u8>) -> Result<LogIndex, PaxosError> {
    let max_attempts = ctx.config.retry.max_attempts;
    let mut attempts = 0;

    loop {
        ctx.ensure_running()?;
        let (index, ballot, start) = reserve_slot(ctx)?;
        attempts += 1;

        match run_round(ctx, index, ballot, value.clone(), start).await {
            Ok(outcome) if outcome.own_value => return Ok(outcome.index),
            Ok(outcome) => {
                debug!(
                    node = %ctx.id,
                    index = %outcome.index,
                    ballot = %outcome.ballot,
                    "index taken by an earlier value, moving on"
                );
            }
            Err(err) => {
                ctx.ensure_running()?;
                warn!(
                    node = %ctx.id,
                    index = %index,
                    ballot = %ballot,
                    attempt = attempts,
                    error = %err,
                    "append attempt failed"
                );
                schedule_hole_fill(ctx, index);
                if attempts >= max_attempts {
                    return Err(PaxosError::WriteTimeout { attempts });
                }
                tokio::time::sleep(ctx.backoff()).await;
                continue;
            }
        }

        if attempts >= max_attempts {
            return Err(PaxosError::WriteTimeout { attempts });
        }
    }
}

/// Commit a no-op at `index` unless something else gets there first.
///
/// At most one fill runs per index.
pub(crate) fn schedule_hole_fill(ctx: &Rc<NodeContext>, index: LogIndex) {
    if !ctx.state.borrow_mut().hole_fills.insert(index) {
        debug!(node = %ctx.id, index = %index, "hole fill already running");
        return;
    }
    let ctx = ctx.clone();
    tokio::task::spawn_local(async move {
        fill_hole(&ctx, index).await;
        ctx.state.borrow_mut().hole_fills.remove(&index);
    });
}

/// Waits one request timeout so the failed round's own messages settle.
async fn fill_hole(ctx: &Rc<NodeContext>, index: LogIndex) {
    tokio::time::sleep(ctx.config.request_timeout).await;

    for attempt in 1..=ctx.config.retry.max_attempts {
        if ctx.is_shut_down() || ctx.is_committed(index) {
            return;
        }
        let value = match noop_record(ctx) {
            Ok(value) => value,
            Err(err) => {
                warn!(node = %ctx.id, index = %index, error = %err, "cannot encode no-op");
                return;
            }
        };
        let ballot = ctx.fresh_ballot();
        match run_round(ctx, index, ballot, value, RoundStart::Prepare).await {
            Ok(outcome) => {
                debug!(
                    node = %ctx.id,
                    index = %index,
                    no_op = outcome.own_value,
                    "hole filled"
                );
                return;
            }
            Err(err) => {
                debug!(node = %ctx.id, index = %index, attempt, error = %err, "hole fill failed");
                tokio::time::sleep(ctx.backoff()).await;
            }
        }
    }
}

/// Replicate `command` and wait until it is applied locally.
pub(crate) async fn execute(
    ctx: &Rc<NodeContext>,
    command: Command,
) -> Result<CommandResult, PaxosError> {
    ctx.ensure_running()?;
    let id = ctx.next_request_id();
    let value = LogRecord { id, command }.encode()?;

    let (waiter, mut receiver) = oneshot::channel();
    ctx.state.borrow_mut().engine.register(id, waiter);

    if let Err(err) = append(ctx, value).await {
        // An earlier attempt may have been carried to commit by another round.
        if let Ok(result) = receiver.try_recv() {
            return result;
        }
        ctx.state.borrow_mut().engine.cancel(id);
        return Err(err);
    }

    match tokio::time::timeout(ctx.config.client_timeout, &mut receiver).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(PaxosError::Shutdown),
        Err(_) => {
            ctx.state.borrow_mut().engine.cancel(id);
            info!(node = %ctx.id, sequence = id.sequence, "command chosen but not applied in time");
            Err(PaxosError::RequestTimeout)
        }
    }
}

/// Read `key` after a no-op barrier, so every write chosen before the read
/// started is visible.
pub(crate) async fn read(ctx: &Rc<NodeContext>, key: &str) -> Result<Option<String>, PaxosError> {
    execute(ctx, Command::NoOp).await?;
    Ok(ctx.state.borrow().engine.get(key))
}
