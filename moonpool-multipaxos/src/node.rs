//! The node actor.
//!
//! A node plays every role at once: acceptor for all indices, proposer for
//! its clients' appends, and in leader-based mode candidate or leader. All
//! of its state lives in one [`NodeState`] behind a `RefCell`, owned by a
//! single task on a `LocalSet`:
//!
//! ```text
//!              NodeHandle (clients)        Transport (peers)
//!                     │                          │
//!                     ▼                          ▼
//!            ┌──────────────────── mailbox ────────────────────┐
//!            │  Node::run: select { tick, mailbox }            │
//!            │    Peer request   → acceptor handlers, reply    │
//!            │    Peer response  → PendingRequests → quorum    │
//!            │    Client request → spawn_local(proposer task)  │
//!            │    tick           → expire, heartbeat, elect    │
//!            └─────────────────────────────────────────────────┘
//! ```
//!
//! Handlers borrow the state, mutate it and release it before anything is
//! awaited. Proposer and election tasks interleave with message handling
//! only at their `.await` points.
//!
//! ## Raft Comparison
//!
//! | Node Field | Raft Equivalent |
//! |---|---|
//! | `role` | follower / candidate / leader |
//! | `ballot` | `currentTerm` of the last election this node ran |
//! | `log.promised()` | persisted `currentTerm` / `votedFor` |
//! | `known_leader` | `leaderId` |
//! | `next_index` | next index the leader hands out |

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::acceptor;
use crate::apply::ApplyEngine;
use crate::config::{PaxosConfig, ProposalMode};
use crate::election;
use crate::heartbeat::FailureDetector;
use crate::kv::{Command, CommandResult, LogRecord, RequestId, StateMachine};
use crate::log::ReplicatedLog;
use crate::messages::{
    CommitRequest, CorrelationId, Envelope, HeartbeatRequest, HeartbeatResponse, PeerMessage,
    Reply,
};
use crate::proposer;
use crate::quorum::{PendingRequests, QuorumAggregator, QuorumFuture, ResponseSink};
use crate::slot::SlotState;
use crate::storage::PaxosStorage;
use crate::transport::Transport;
use crate::types::{Ballot, ClusterView, LogIndex, NodeId, PaxosError};

/// Most committed entries pushed to one lagging follower per heartbeat.
const CATCH_UP_BATCH: usize = 32;

// =============================================================================
// Public types
// =============================================================================

/// What part a node currently plays in leader-based mode.
///
/// In leaderless mode every node stays a `Follower`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Accepts values and waits for heartbeats.
    Follower,
    /// Running a full-log prepare.
    Candidate,
    /// Won an election. Serves appends once recovery is done.
    Leader,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeRole::Follower => "follower",
            NodeRole::Candidate => "candidate",
            NodeRole::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// Requests a client can make of its local node.
pub enum ClientRequest {
    /// Append a command and wait for its result.
    Execute {
        /// Command to replicate.
        command: Command,
        /// Where the result goes.
        reply: oneshot::Sender<Result<CommandResult, PaxosError>>,
    },
    /// Linearizable read behind a no-op barrier.
    Read {
        /// Key to read.
        key: String,
        /// Where the value goes.
        reply: oneshot::Sender<Result<Option<String>, PaxosError>>,
    },
    /// Start an election now.
    Elect {
        /// The ballot this node leads under, once recovery is done.
        reply: oneshot::Sender<Result<Ballot, PaxosError>>,
    },
    /// Snapshot the node's state.
    Status {
        /// Where the snapshot goes.
        reply: oneshot::Sender<NodeStatus>,
    },
}

/// Everything a node's mailbox carries.
pub enum NodeEvent {
    /// A message from a peer, or from this node to itself.
    Peer(Envelope),
    /// A client request.
    Client(ClientRequest),
    /// Stop the node.
    Shutdown,
}

/// Point-in-time view of a node, for tests and operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// The node.
    pub id: NodeId,
    /// Its role.
    pub role: NodeRole,
    /// Ballot of the last election it ran.
    pub ballot: Ballot,
    /// Leader it currently follows.
    pub leader: Option<NodeId>,
    /// Whether it is a leader done with recovery.
    pub leader_ready: bool,
    /// Its log-wide promise.
    pub promised: Ballot,
    /// Highest index applied to its state machine.
    pub applied_up_to: Option<LogIndex>,
    /// Every slot it holds.
    pub slots: BTreeMap<LogIndex, SlotState>,
}

impl NodeStatus {
    /// The value committed at `index`, if any.
    pub fn committed_value(&self, index: LogIndex) -> Option<&[u8]> {
        self.slots.get(&index).and_then(SlotState::committed_value)
    }

    /// Every committed `(index, value)` pair, in index order.
    pub fn committed(&self) -> impl Iterator<Item = (LogIndex, &[u8])> {
        self.slots
            .iter()
            .filter_map(|(index, slot)| slot.committed_value().map(|value| (*index, value)))
    }

    /// Whether this node serves appends in leader-based mode.
    pub fn is_ready_leader(&self) -> bool {
        self.role == NodeRole::Leader && self.leader_ready
    }
}

// =============================================================================
// Node state
// =============================================================================

/// Mutable state of one node. Only ever touched from the node's task set.
pub(crate) struct NodeState {
    pub(crate) role: NodeRole,
    pub(crate) ballot: Ballot,
    pub(crate) leader_ready: bool,
    pub(crate) known_leader: Option<NodeId>,
    pub(crate) election_in_flight: bool,
    /// Highest ballot counter observed anywhere.
    pub(crate) max_seen: u64,
    pub(crate) next_index: LogIndex,
    pub(crate) incarnation: u64,
    pub(crate) sequence: u64,
    pub(crate) log: ReplicatedLog,
    pub(crate) engine: ApplyEngine,
    pub(crate) pending: PendingRequests,
    pub(crate) detector: FailureDetector,
    pub(crate) last_heartbeat_sent: Option<Duration>,
    /// First unapplied index and when it was first seen stuck.
    pub(crate) gap_watch: Option<(LogIndex, Duration)>,
    /// Indices with a hole fill in flight.
    pub(crate) hole_fills: BTreeSet<LogIndex>,
    pub(crate) rng: StdRng,
    pub(crate) shut_down: bool,
}

impl NodeState {
    /// A ballot above every one observed so far.
    pub(crate) fn fresh_ballot(&mut self, me: NodeId) -> Ballot {
        self.max_seen += 1;
        Ballot::new(self.max_seen, me)
    }

    pub(crate) fn observe(&mut self, ballot: Ballot) {
        self.max_seen = self.max_seen.max(ballot.counter);
    }

    pub(crate) fn next_request_id(&mut self, me: NodeId) -> RequestId {
        self.sequence += 1;
        RequestId {
            node: me,
            incarnation: self.incarnation,
            sequence: self.sequence,
        }
    }

    pub(crate) fn reset_election_timer(&mut self, now: Duration) {
        self.detector.reset_timeout(now, &mut self.rng);
    }

    pub(crate) fn become_follower(&mut self, leader: Option<NodeId>, now: Duration) {
        if self.role != NodeRole::Follower {
            info!(from = %self.role, ballot = %self.ballot, "stepping down");
        }
        self.role = NodeRole::Follower;
        self.leader_ready = false;
        self.known_leader = leader;
        self.reset_election_timer(now);
    }

    /// Defer to the holder of `ballot`, unless this node campaigns or leads
    /// under a higher ballot. Returns whether this node is now a follower.
    fn yield_to(&mut self, ballot: Ballot, now: Duration) -> bool {
        if self.role == NodeRole::Follower {
            return true;
        }
        if ballot.is_after(&self.ballot) {
            self.become_follower(None, now);
            return true;
        }
        false
    }

    /// A propose or commit at the log-wide promise proves the promising
    /// leader alive.
    fn note_leader_contact(&mut self, me: NodeId, ballot: Ballot, now: Duration) {
        if ballot != self.log.promised() || ballot.node == me {
            return;
        }
        if self.yield_to(ballot, now) {
            self.known_leader = Some(ballot.node);
            self.detector.record_contact(now);
        }
    }

    fn on_heartbeat(
        &mut self,
        me: NodeId,
        from: NodeId,
        request: &HeartbeatRequest,
        now: Duration,
    ) -> Result<HeartbeatResponse, PaxosError> {
        let promised = self.log.promised();
        let success = if request.ballot.is_after(&promised) {
            self.log.raise_promise(request.ballot)?;
            true
        } else {
            request.ballot == promised
        };

        if success && from != me && self.yield_to(request.ballot, now) {
            self.known_leader = Some(from);
            self.detector.record_contact(now);
        }

        Ok(HeartbeatResponse {
            ballot: request.ballot,
            success,
            promised_ballot: self.log.promised(),
            first_unapplied: self.log.first_unapplied(),
        })
    }

    pub(crate) fn apply_committed(&mut self) -> Result<Vec<LogIndex>, PaxosError> {
        self.engine.drain(&mut self.log)
    }

    /// The first unapplied index, once it has blocked committed entries
    /// behind it for `patience`.
    fn stalled_gap(&mut self, now: Duration, patience: Duration) -> Option<LogIndex> {
        let first = self.log.first_unapplied();
        let blocked = self.log.next_to_apply().is_none()
            && self
                .log
                .slots()
                .range(first.next()..)
                .any(|(_, slot)| slot.is_committed());
        if !blocked {
            self.gap_watch = None;
            return None;
        }
        match self.gap_watch {
            Some((index, since)) if index == first => {
                if now.saturating_sub(since) >= patience {
                    self.gap_watch = Some((first, now));
                    Some(first)
                } else {
                    None
                }
            }
            _ => {
                self.gap_watch = Some((first, now));
                None
            }
        }
    }
}

// =============================================================================
// Node context
// =============================================================================

/// Shared, immutable identity plus the node's state cell.
///
/// Proposer and election tasks hold an `Rc` to it.
pub(crate) struct NodeContext {
    pub(crate) id: NodeId,
    pub(crate) cluster: ClusterView,
    pub(crate) config: PaxosConfig,
    transport: Rc<dyn Transport>,
    started: Instant,
    pub(crate) state: RefCell<NodeState>,
}

enum TickAction {
    Heartbeat(Ballot),
    Elect,
    FillGap(LogIndex),
}

impl NodeContext {
    /// Time since the node started.
    pub(crate) fn now(&self) -> Duration {
        Instant::now().duration_since(self.started)
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.state.borrow().shut_down
    }

    pub(crate) fn ensure_running(&self) -> Result<(), PaxosError> {
        if self.is_shut_down() {
            return Err(PaxosError::Shutdown);
        }
        Ok(())
    }

    pub(crate) fn fresh_ballot(&self) -> Ballot {
        self.state.borrow_mut().fresh_ballot(self.id)
    }

    pub(crate) fn next_request_id(&self) -> RequestId {
        self.state.borrow_mut().next_request_id(self.id)
    }

    pub(crate) fn backoff(&self) -> Duration {
        let mut state = self.state.borrow_mut();
        self.config.retry.backoff(&mut state.rng)
    }

    pub(crate) fn is_committed(&self, index: LogIndex) -> bool {
        self.state
            .borrow()
            .log
            .slot(index)
            .is_some_and(SlotState::is_committed)
    }

    /// Send `message` to every member, self included, and aggregate the
    /// replies that satisfy `predicate`.
    ///
    /// Every request is registered with the request timeout, so the returned
    /// future always resolves.
    pub(crate) fn broadcast<T: Reply + 'static>(
        &self,
        message: PeerMessage,
        predicate: impl Fn(&T) -> bool + 'static,
    ) -> QuorumFuture<T> {
        let members = self.cluster.members().to_vec();
        let (aggregator, future) =
            QuorumAggregator::new(members.len(), self.cluster.quorum_size(), predicate);

        let requests = {
            let mut state = self.state.borrow_mut();
            if state.shut_down {
                // Dropping the aggregator fails the future.
                return future;
            }
            let sink: Rc<RefCell<dyn ResponseSink>> = Rc::new(RefCell::new(aggregator));
            let deadline = Instant::now() + self.config.request_timeout;
            members
                .into_iter()
                .map(|peer| (peer, state.pending.register(peer, deadline, sink.clone())))
                .collect::<Vec<_>>()
        };

        for (peer, correlation_id) in requests {
            let envelope = Envelope {
                from: self.id,
                to: peer,
                correlation_id,
                message: message.clone(),
            };
            if let Err(err) = self.transport.send(envelope) {
                self.state.borrow_mut().pending.fail(correlation_id, err);
            }
        }
        future
    }

    fn send(&self, to: NodeId, correlation_id: CorrelationId, message: PeerMessage) {
        let kind = message.kind();
        let envelope = Envelope {
            from: self.id,
            to,
            correlation_id,
            message,
        };
        if let Err(err) = self.transport.send(envelope) {
            debug!(node = %self.id, peer = %to, kind, error = %err, "send failed");
        }
    }

    /// Step down if a peer reports a promise above the ballot this node
    /// leads or campaigns under.
    ///
    /// Promises for this node's own ballots are ignored: a hole fill runs
    /// under a fresh ballot above the leader's own.
    pub(crate) fn step_down_if_superseded(&self, promised: Ballot) {
        let now = self.now();
        let mut state = self.state.borrow_mut();
        if state.role != NodeRole::Follower
            && promised.node != self.id
            && promised.is_after(&state.ballot)
        {
            info!(
                node = %self.id,
                ballot = %state.ballot,
                promised = %promised,
                "superseded by higher ballot"
            );
            state.become_follower(None, now);
        }
    }

    // -------------------------------------------------------------------------
    // Peer messages
    // -------------------------------------------------------------------------

    pub(crate) fn handle_peer(&self, envelope: Envelope) {
        if envelope.to != self.id {
            debug!(node = %self.id, to = %envelope.to, "dropping misaddressed envelope");
            return;
        }
        if let Some(ballot) = envelope.message.ballot_hint() {
            self.state.borrow_mut().observe(ballot);
        }

        if envelope.message.is_response() {
            self.on_response(envelope);
            return;
        }

        let Envelope {
            from,
            correlation_id,
            message,
            ..
        } = envelope;
        // Unsolicited commits need no acknowledgement.
        let wants_reply =
            correlation_id != CorrelationId::NONE || matches!(message, PeerMessage::Heartbeat(_));

        match self.on_request(from, &message) {
            Ok(Some(reply)) if wants_reply => self.send(from, correlation_id, reply),
            Ok(_) => {}
            Err(err) => warn!(
                node = %self.id,
                peer = %from,
                kind = message.kind(),
                error = %err,
                "request failed"
            ),
        }
    }

    fn on_request(
        &self,
        from: NodeId,
        message: &PeerMessage,
    ) -> Result<Option<PeerMessage>, PaxosError> {
        let now = self.now();
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;

        let reply = match message {
            PeerMessage::Prepare(request) => {
                PeerMessage::PrepareResponse(acceptor::on_prepare(&mut state.log, request)?)
            }
            PeerMessage::Propose(request) => {
                let response = acceptor::on_propose(&mut state.log, request)?;
                if response.accepted {
                    state.note_leader_contact(self.id, request.ballot, now);
                }
                PeerMessage::ProposeResponse(response)
            }
            PeerMessage::Commit(request) => {
                let (response, newly_committed) = acceptor::on_commit(&mut state.log, request)?;
                state.note_leader_contact(self.id, request.ballot, now);
                if newly_committed {
                    let applied = state.apply_committed()?;
                    if !applied.is_empty() {
                        debug!(node = %self.id, count = applied.len(), "applied entries");
                    }
                }
                PeerMessage::CommitResponse(response)
            }
            PeerMessage::FullLogPrepare(request) => {
                let response = acceptor::on_full_log_prepare(&mut state.log, request)?;
                if response.promised && from != self.id && state.yield_to(request.ballot, now) {
                    state.known_leader = None;
                    state.reset_election_timer(now);
                }
                PeerMessage::FullLogPrepareResponse(response)
            }
            PeerMessage::Heartbeat(request) => {
                PeerMessage::HeartbeatResponse(state.on_heartbeat(self.id, from, request, now)?)
            }
            PeerMessage::PrepareResponse(_)
            | PeerMessage::ProposeResponse(_)
            | PeerMessage::CommitResponse(_)
            | PeerMessage::FullLogPrepareResponse(_)
            | PeerMessage::HeartbeatResponse(_) => return Ok(None),
        };
        Ok(Some(reply))
    }

    fn on_response(&self, envelope: Envelope) {
        if let Some(promised) = envelope.message.rejection() {
            self.step_down_if_superseded(promised);
        }

        if let PeerMessage::HeartbeatResponse(response) = &envelope.message {
            self.on_heartbeat_response(envelope.from, response);
            return;
        }

        let kind = envelope.message.kind();
        let routed = self.state.borrow_mut().pending.complete(
            envelope.correlation_id,
            envelope.from,
            envelope.message,
        );
        if !routed {
            debug!(
                node = %self.id,
                peer = %envelope.from,
                kind,
                "dropping late or unmatched reply"
            );
        }
    }

    /// Push committed entries a follower has not applied yet.
    fn on_heartbeat_response(&self, from: NodeId, response: &HeartbeatResponse) {
        if !response.success {
            return;
        }
        let commits: Vec<CommitRequest> = {
            let state = self.state.borrow();
            if state.role != NodeRole::Leader || state.ballot != response.ballot {
                return;
            }
            state
                .log
                .slots()
                .range(response.first_unapplied..)
                .filter_map(|(index, slot)| {
                    let ballot = slot.committed_ballot()?;
                    let value = slot.committed_value()?;
                    Some(CommitRequest {
                        index: *index,
                        ballot,
                        value: value.to_vec(),
                    })
                })
                .take(CATCH_UP_BATCH)
                .collect()
        };
        if commits.is_empty() {
            return;
        }
        debug!(
            node = %self.id,
            peer = %from,
            from_index = %response.first_unapplied,
            count = commits.len(),
            "catching up follower"
        );
        for commit in commits {
            self.send(from, CorrelationId::NONE, PeerMessage::Commit(commit));
        }
    }

    // -------------------------------------------------------------------------
    // Tick
    // -------------------------------------------------------------------------

    pub(crate) fn on_tick(self: &Rc<Self>) {
        let expired = self.state.borrow_mut().pending.expire(Instant::now());
        if expired > 0 {
            debug!(node = %self.id, expired, "expired pending requests");
        }

        let now = self.now();
        let action = {
            let mut state = self.state.borrow_mut();
            self.next_tick_action(&mut state, now)
        };

        match action {
            Some(TickAction::Heartbeat(ballot)) => {
                for peer in self.cluster.members() {
                    if *peer != self.id {
                        self.send(
                            *peer,
                            CorrelationId::NONE,
                            PeerMessage::Heartbeat(HeartbeatRequest { ballot }),
                        );
                    }
                }
            }
            Some(TickAction::Elect) => {
                info!(node = %self.id, "leader timed out, starting election");
                let ctx = self.clone();
                tokio::task::spawn_local(async move {
                    if let Err(err) = election::run_election(&ctx).await {
                        debug!(node = %ctx.id, error = %err, "election failed");
                    }
                });
            }
            Some(TickAction::FillGap(index)) => {
                info!(node = %self.id, index = %index, "log gap blocks apply, filling");
                proposer::schedule_hole_fill(self, index);
            }
            None => {}
        }
    }

    fn next_tick_action(&self, state: &mut NodeState, now: Duration) -> Option<TickAction> {
        let may_fill = match self.config.mode {
            ProposalMode::Leaderless => true,
            ProposalMode::LeaderBased => state.role == NodeRole::Leader && state.leader_ready,
        };
        if may_fill {
            if let Some(index) = state.stalled_gap(now, self.config.request_timeout * 2) {
                return Some(TickAction::FillGap(index));
            }
        }

        if self.config.mode != ProposalMode::LeaderBased {
            return None;
        }
        match state.role {
            NodeRole::Leader if state.leader_ready => {
                let due = state.last_heartbeat_sent.map_or(true, |sent| {
                    now.saturating_sub(sent) >= self.config.heartbeat.heartbeat_interval
                });
                if due {
                    state.last_heartbeat_sent = Some(now);
                    Some(TickAction::Heartbeat(state.ballot))
                } else {
                    None
                }
            }
            NodeRole::Follower
                if !state.election_in_flight && state.detector.is_timed_out(now) =>
            {
                Some(TickAction::Elect)
            }
            _ => None,
        }
    }

    // -------------------------------------------------------------------------
    // Clients
    // -------------------------------------------------------------------------

    pub(crate) fn handle_client(self: &Rc<Self>, request: ClientRequest) {
        match request {
            ClientRequest::Execute { command, reply } => {
                let ctx = self.clone();
                tokio::task::spawn_local(async move {
                    let _ = reply.send(proposer::execute(&ctx, command).await);
                });
            }
            ClientRequest::Read { key, reply } => {
                let ctx = self.clone();
                tokio::task::spawn_local(async move {
                    let _ = reply.send(proposer::read(&ctx, &key).await);
                });
            }
            ClientRequest::Elect { reply } => {
                let ctx = self.clone();
                tokio::task::spawn_local(async move {
                    let _ = reply.send(election::run_election(&ctx).await);
                });
            }
            ClientRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    pub(crate) fn status(&self) -> NodeStatus {
        let state = self.state.borrow();
        NodeStatus {
            id: self.id,
            role: state.role,
            ballot: state.ballot,
            leader: state.known_leader,
            leader_ready: state.leader_ready,
            promised: state.log.promised(),
            applied_up_to: state.log.applied_up_to(),
            slots: state.log.slots().clone(),
        }
    }

    fn shutdown(&self) {
        let mut state = self.state.borrow_mut();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        state.pending.fail_all(PaxosError::Shutdown);
        state.engine.fail_all(PaxosError::Shutdown);
        info!(node = %self.id, "node shut down");
    }
}

// =============================================================================
// Node
// =============================================================================

/// A cluster member. Drive it with [`Node::run`] on a `LocalSet`.
pub struct Node {
    ctx: Rc<NodeContext>,
    mailbox: mpsc::UnboundedReceiver<NodeEvent>,
}

impl Node {
    /// Open the node's log, replay committed entries into `state_machine`
    /// and return the node with a handle to its mailbox.
    ///
    /// The caller must route every envelope addressed to `id` into
    /// [`NodeHandle::mailbox`].
    pub fn new(
        id: NodeId,
        cluster: ClusterView,
        config: PaxosConfig,
        transport: Rc<dyn Transport>,
        storage: Box<dyn PaxosStorage>,
        state_machine: Box<dyn StateMachine>,
    ) -> Result<(Self, NodeHandle), PaxosError> {
        config.validate()?;
        if !cluster.contains(id) {
            return Err(PaxosError::InvalidConfig(format!(
                "{id} is not a cluster member"
            )));
        }

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ u64::from(id.0)),
            None => StdRng::from_entropy(),
        };

        let mut log = ReplicatedLog::open(storage)?;
        let mut engine = ApplyEngine::new(state_machine);
        let replayed = engine.drain(&mut log)?;

        let max_seen = log
            .slots()
            .values()
            .flat_map(|slot| [Some(slot.promised()), slot.accepted().map(|a| a.ballot)])
            .flatten()
            .chain(std::iter::once(log.promised()))
            .map(|ballot| ballot.counter)
            .max()
            .unwrap_or(0);
        let next_index = log.next_free_index();

        info!(
            node = %id,
            replayed = replayed.len(),
            promised = %log.promised(),
            next_index = %next_index,
            "node opened"
        );

        let detector = FailureDetector::new(config.heartbeat.clone(), Duration::ZERO, &mut rng);
        let state = NodeState {
            role: NodeRole::Follower,
            ballot: Ballot::EMPTY,
            leader_ready: false,
            known_leader: None,
            election_in_flight: false,
            max_seen,
            next_index,
            incarnation: rng.gen(),
            sequence: 0,
            log,
            engine,
            pending: PendingRequests::new(),
            detector,
            last_heartbeat_sent: None,
            gap_watch: None,
            hole_fills: BTreeSet::new(),
            rng,
            shut_down: false,
        };

        let (sender, mailbox) = mpsc::unbounded_channel();
        let ctx = Rc::new(NodeContext {
            id,
            cluster,
            config,
            transport,
            started: Instant::now(),
            state: RefCell::new(state),
        });
        Ok((Self { ctx, mailbox }, NodeHandle { id, sender }))
    }

    /// This node's id.
    pub fn id(&self) -> NodeId {
        self.ctx.id
    }

    /// Process events until shut down.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.ctx.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(node = %self.ctx.id, mode = ?self.ctx.config.mode, "node running");

        loop {
            tokio::select! {
                biased;
                _ = tick.tick() => self.ctx.on_tick(),
                event = self.mailbox.recv() => match event {
                    Some(NodeEvent::Peer(envelope)) => self.ctx.handle_peer(envelope),
                    Some(NodeEvent::Client(request)) => self.ctx.handle_client(request),
                    Some(NodeEvent::Shutdown) | None => break,
                },
            }
        }

        self.ctx.shutdown();
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cheap, cloneable client handle to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    id: NodeId,
    sender: mpsc::UnboundedSender<NodeEvent>,
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle").field("id", &self.id).finish()
    }
}

impl NodeHandle {
    /// The node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The node's mailbox, for a transport to deliver into.
    pub fn mailbox(&self) -> mpsc::UnboundedSender<NodeEvent> {
        self.sender.clone()
    }

    /// Replicate `command` and return its result once applied locally.
    pub async fn execute(&self, command: Command) -> Result<CommandResult, PaxosError> {
        self.call(|reply| ClientRequest::Execute { command, reply })
            .await?
    }

    /// Set `key` to `value`.
    pub async fn set(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<CommandResult, PaxosError> {
        self.execute(Command::Set {
            key: key.into(),
            value: value.into(),
        })
        .await
    }

    /// Read `key` behind a no-op barrier.
    pub async fn get(&self, key: impl Into<String>) -> Result<Option<String>, PaxosError> {
        let key = key.into();
        self.call(|reply| ClientRequest::Read { key, reply }).await?
    }

    /// Make this node campaign for leadership.
    pub async fn elect(&self) -> Result<Ballot, PaxosError> {
        self.call(|reply| ClientRequest::Elect { reply }).await?
    }

    /// Snapshot the node's state.
    pub async fn status(&self) -> Result<NodeStatus, PaxosError> {
        self.call(|reply| ClientRequest::Status { reply }).await
    }

    /// Ask the node to stop. Pending requests fail with `Shutdown`.
    pub fn shutdown(&self) {
        let _ = self.sender.send(NodeEvent::Shutdown);
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ClientRequest,
    ) -> Result<T, PaxosError> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(NodeEvent::Client(make(reply)))
            .map_err(|_| PaxosError::Shutdown)?;
        receiver.await.map_err(|_| PaxosError::Shutdown)
    }
}

/// Encode a no-op record under a fresh request id.
pub(crate) fn noop_record(ctx: &NodeContext) -> Result<Vec<u8>, PaxosError> {
    LogRecord {
        id: ctx.next_request_id(),
        command: Command::NoOp,
    }
    .encode()
}
