//! Majority-response aggregation and request correlation.
//!
//! A broadcast sends one request per cluster member and registers each one
//! in [`PendingRequests`] against a shared [`QuorumAggregator`]. The
//! aggregator resolves its [`QuorumFuture`] exactly once:
//!
//! ```text
//! Broadcast:
//!   1. QuorumAggregator::new(expected, quorum, predicate) -> (aggregator, future)
//!   2. PendingRequests::register(peer, deadline, aggregator) per member
//!   3. Transport sends one Envelope per member
//!   4. Caller awaits the future
//!
//! Reply:
//!   5. PendingRequests::complete(correlation_id, from, message)
//!   6. aggregator.on_response() counts matching / non-matching
//!   7. quorum reached          -> future resolves Ok(matching replies)
//!      quorum now impossible   -> future resolves Err(QuorumFailure)
//!
//! Expiry:
//!   5'. PendingRequests::expire(now) on every node tick
//!   6'. aggregator.on_error(RequestTimeout)
//! ```
//!
//! Anything arriving after resolution is dropped. Because every request is
//! either answered or expired, every aggregator eventually resolves.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::messages::{CorrelationId, PeerMessage, Reply};
use crate::types::{Ballot, NodeId, PaxosError};

/// Why a quorum could not be reached.
#[derive(Debug)]
pub struct QuorumFailure<T> {
    /// Replies that did not satisfy the predicate.
    pub rejections: Vec<(NodeId, T)>,
    /// Requests that failed or expired.
    pub errors: usize,
    /// Matching replies received.
    pub got: usize,
    /// Matching replies needed.
    pub needed: usize,
}

impl<T: Reply> QuorumFailure<T> {
    /// Highest promise reported by a refusing peer.
    pub fn highest_rejection(&self) -> Option<Ballot> {
        self.rejections
            .iter()
            .filter_map(|(_, reply)| reply.rejected_by())
            .max()
    }

    /// Turn the failure into an error for a round run under `ballot`.
    ///
    /// A refusal from a peer holding a higher promise wins over a plain
    /// shortage of replies.
    pub fn into_error(self, ballot: Ballot) -> PaxosError {
        match self.highest_rejection() {
            Some(promised) if promised.is_after(&ballot) => {
                PaxosError::RejectedBallot { ballot, promised }
            }
            _ => PaxosError::QuorumUnreachable {
                got: self.got,
                needed: self.needed,
            },
        }
    }
}

type Resolution<T> = Result<Vec<(NodeId, T)>, QuorumFailure<T>>;

/// Collects replies to one broadcast until a majority agrees or can no
/// longer agree.
pub struct QuorumAggregator<T> {
    expected: usize,
    quorum: usize,
    predicate: Box<dyn Fn(&T) -> bool>,
    matching: Vec<(NodeId, T)>,
    non_matching: Vec<(NodeId, T)>,
    errors: usize,
    sender: Option<oneshot::Sender<Resolution<T>>>,
}

impl<T> QuorumAggregator<T> {
    /// Create an aggregator expecting `expected` replies, of which `quorum`
    /// must satisfy `predicate`.
    pub fn new(
        expected: usize,
        quorum: usize,
        predicate: impl Fn(&T) -> bool + 'static,
    ) -> (Self, QuorumFuture<T>) {
        let (sender, receiver) = oneshot::channel();
        let mut aggregator = Self {
            expected,
            quorum,
            predicate: Box::new(predicate),
            matching: Vec::new(),
            non_matching: Vec::new(),
            errors: 0,
            sender: Some(sender),
        };
        aggregator.check();
        (aggregator, QuorumFuture { receiver, quorum })
    }

    /// Record a reply from `from`.
    pub fn on_response(&mut self, from: NodeId, response: T) {
        if self.is_resolved() {
            return;
        }
        if (self.predicate)(&response) {
            self.matching.push((from, response));
        } else {
            self.non_matching.push((from, response));
        }
        self.check();
    }

    /// Record a failed or expired request to `from`.
    pub fn on_error(&mut self, from: NodeId, error: PaxosError) {
        if self.is_resolved() {
            return;
        }
        debug!(peer = %from, error = %error, "quorum request failed");
        self.errors += 1;
        self.check();
    }

    /// Whether the future has already been resolved.
    pub fn is_resolved(&self) -> bool {
        self.sender.is_none()
    }

    fn received(&self) -> usize {
        self.matching.len() + self.non_matching.len() + self.errors
    }

    fn check(&mut self) {
        let got = self.matching.len();
        let remaining = self.expected.saturating_sub(self.received());
        if got >= self.quorum {
            if let Some(sender) = self.sender.take() {
                let _ = sender.send(Ok(std::mem::take(&mut self.matching)));
            }
        } else if got + remaining < self.quorum {
            if let Some(sender) = self.sender.take() {
                let _ = sender.send(Err(QuorumFailure {
                    rejections: std::mem::take(&mut self.non_matching),
                    errors: self.errors,
                    got,
                    needed: self.quorum,
                }));
            }
        }
    }
}

/// Future side of a [`QuorumAggregator`].
///
/// If the aggregator is dropped unresolved the future fails with no replies.
pub struct QuorumFuture<T> {
    receiver: oneshot::Receiver<Resolution<T>>,
    quorum: usize,
}

impl<T> Future for QuorumFuture<T> {
    type Output = Resolution<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let quorum = self.quorum;
        Pin::new(&mut self.receiver).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Err(QuorumFailure {
                    rejections: Vec::new(),
                    errors: 0,
                    got: 0,
                    needed: quorum,
                })
            })
        })
    }
}

/// Type-erased receiver of routed replies.
pub trait ResponseSink {
    /// Deliver a reply from `from`.
    fn deliver(&mut self, from: NodeId, message: PeerMessage);
    /// Report that the request to `from` failed.
    fn fail(&mut self, from: NodeId, error: PaxosError);
}

impl<T: Reply> ResponseSink for QuorumAggregator<T> {
    fn deliver(&mut self, from: NodeId, message: PeerMessage) {
        let kind = message.kind();
        match T::from_message(message) {
            Some(reply) => self.on_response(from, reply),
            None => self.on_error(
                from,
                PaxosError::InvalidState(format!("unexpected {kind} reply")),
            ),
        }
    }

    fn fail(&mut self, from: NodeId, error: PaxosError) {
        self.on_error(from, error);
    }
}

struct PendingRequest {
    peer: NodeId,
    deadline: Instant,
    sink: Rc<RefCell<dyn ResponseSink>>,
}

/// Outstanding requests by correlation id.
pub struct PendingRequests {
    next_id: u64,
    entries: HashMap<CorrelationId, PendingRequest>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    /// Empty table. Ids start above [`CorrelationId::NONE`].
    pub fn new() -> Self {
        Self {
            next_id: CorrelationId::NONE.0 + 1,
            entries: HashMap::new(),
        }
    }

    /// Track a request to `peer` that expires at `deadline`.
    pub fn register(
        &mut self,
        peer: NodeId,
        deadline: Instant,
        sink: Rc<RefCell<dyn ResponseSink>>,
    ) -> CorrelationId {
        let id = CorrelationId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            PendingRequest {
                peer,
                deadline,
                sink,
            },
        );
        id
    }

    /// Route a reply. Returns `false` for unknown, late or misaddressed replies.
    pub fn complete(&mut self, id: CorrelationId, from: NodeId, message: PeerMessage) -> bool {
        match self.entries.get(&id) {
            Some(entry) if entry.peer == from => {}
            _ => return false,
        }
        match self.entries.remove(&id) {
            Some(entry) => {
                entry.sink.borrow_mut().deliver(from, message);
                true
            }
            None => false,
        }
    }

    /// Fail one request.
    pub fn fail(&mut self, id: CorrelationId, error: PaxosError) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                entry.sink.borrow_mut().fail(entry.peer, error);
                true
            }
            None => false,
        }
    }

    /// Fail every request whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<CorrelationId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.fail(*id, PaxosError::RequestTimeout);
        }
        expired.len()
    }

    /// Fail everything, e.g. on shutdown.
    pub fn fail_all(&mut self, error: PaxosError) {
        for (_, entry) in self.entries.drain() {
            entry.sink.borrow_mut().fail(entry.peer, error.clone());
        }
    }

    /// Outstanding request count.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
