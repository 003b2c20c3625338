//! In-process simulated network and cluster harness.
//!
//! [`SimNetwork`] implements [`Transport`] by pushing envelopes straight
//! into the recipient's mailbox, with optional random latency (which also
//! reorders messages). Faults are injected by crashing nodes, partitioning
//! pairs, or installing drop rules:
//!
//! ```text
//!  node(1) ──send──> SimNetwork ──┬── crashed? partitioned? drop rule? ──> dropped
//!                                 └── latency? sleep ──> mailbox of node(2)
//! ```
//!
//! [`SimCluster`] wires `N` nodes to one network, each with its own
//! in-memory "disk" that survives crashes so nodes can be restarted.
//!
//! Everything here spawns with `spawn_local`, so it must run inside a
//! `tokio::task::LocalSet`. Pair it with `start_paused = true` for fast,
//! deterministic time.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::PaxosClient;
use crate::config::PaxosConfig;
use crate::kv::KvStore;
use crate::messages::Envelope;
use crate::node::{Node, NodeEvent, NodeHandle, NodeStatus};
use crate::storage::InMemoryPaxosStorage;
use crate::transport::Transport;
use crate::types::{ClusterView, NodeId, PaxosError};

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Envelopes handed to a mailbox.
    pub delivered: u64,
    /// Envelopes dropped by a fault.
    pub dropped: u64,
}

type DropRule = Box<dyn Fn(&Envelope) -> bool>;

struct NetworkState {
    mailboxes: HashMap<NodeId, mpsc::UnboundedSender<NodeEvent>>,
    crashed: HashSet<NodeId>,
    partitions: HashSet<(NodeId, NodeId)>,
    drop_rules: Vec<DropRule>,
    latency: Option<(Duration, Duration)>,
    rng: StdRng,
    stats: NetworkStats,
}

impl NetworkState {
    fn blocks(&self, envelope: &Envelope) -> bool {
        self.crashed.contains(&envelope.from)
            || self.crashed.contains(&envelope.to)
            || self.partitions.contains(&pair(envelope.from, envelope.to))
            || self.drop_rules.iter().any(|rule| rule(envelope))
    }

    fn deliver(&mut self, envelope: Envelope) {
        if self.blocks(&envelope) {
            self.stats.dropped += 1;
            debug!(
                from = %envelope.from,
                to = %envelope.to,
                kind = envelope.message.kind(),
                "network dropped envelope"
            );
            return;
        }
        let delivered = self
            .mailboxes
            .get(&envelope.to)
            .is_some_and(|mailbox| mailbox.send(NodeEvent::Peer(envelope)).is_ok());
        if delivered {
            self.stats.delivered += 1;
        } else {
            self.stats.dropped += 1;
        }
    }
}

fn pair(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Simulated network shared by every node of a [`SimCluster`].
#[derive(Clone)]
pub struct SimNetwork {
    inner: Rc<RefCell<NetworkState>>,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SimNetwork {
    /// Empty network. `seed` drives latency draws.
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Rc::new(RefCell::new(NetworkState {
                mailboxes: HashMap::new(),
                crashed: HashSet::new(),
                partitions: HashSet::new(),
                drop_rules: Vec::new(),
                latency: None,
                rng: StdRng::seed_from_u64(seed),
                stats: NetworkStats::default(),
            })),
        }
    }

    /// Route envelopes for `node` into `mailbox`, replacing any earlier one.
    pub fn register(&self, node: NodeId, mailbox: mpsc::UnboundedSender<NodeEvent>) {
        self.inner.borrow_mut().mailboxes.insert(node, mailbox);
    }

    /// Drop everything to and from `node`.
    pub fn crash(&self, node: NodeId) {
        self.inner.borrow_mut().crashed.insert(node);
    }

    /// Undo [`SimNetwork::crash`].
    pub fn restore(&self, node: NodeId) {
        self.inner.borrow_mut().crashed.remove(&node);
    }

    /// Whether `node` is crashed.
    pub fn is_crashed(&self, node: NodeId) -> bool {
        self.inner.borrow().crashed.contains(&node)
    }

    /// Cut the link between `a` and `b` in both directions.
    pub fn partition(&self, a: NodeId, b: NodeId) {
        self.inner.borrow_mut().partitions.insert(pair(a, b));
    }

    /// Restore the link between `a` and `b`.
    pub fn heal(&self, a: NodeId, b: NodeId) {
        self.inner.borrow_mut().partitions.remove(&pair(a, b));
    }

    /// Restore every link.
    pub fn heal_all(&self) {
        self.inner.borrow_mut().partitions.clear();
    }

    /// Drop every envelope matching `rule` until the rules are cleared.
    pub fn drop_matching(&self, rule: impl Fn(&Envelope) -> bool + 'static) {
        self.inner.borrow_mut().drop_rules.push(Box::new(rule));
    }

    /// Remove every drop rule.
    pub fn clear_drop_rules(&self) {
        self.inner.borrow_mut().drop_rules.clear();
    }

    /// Delay each envelope by a random duration in `[min, max]`.
    pub fn set_latency(&self, min: Duration, max: Duration) {
        self.inner.borrow_mut().latency = Some((min, max.max(min)));
    }

    /// Delivery counters so far.
    pub fn stats(&self) -> NetworkStats {
        self.inner.borrow().stats
    }
}

impl Transport for SimNetwork {
    fn send(&self, envelope: Envelope) -> Result<(), PaxosError> {
        let mut state = self.inner.borrow_mut();
        if !state.mailboxes.contains_key(&envelope.to) {
            return Err(PaxosError::Network(format!(
                "no route to {}",
                envelope.to
            )));
        }

        let latency = state.latency;
        let delay = latency.map(|(min, max)| {
            let min_ms = min.as_millis() as u64;
            let max_ms = max.as_millis() as u64;
            Duration::from_millis(state.rng.gen_range(min_ms..=max_ms))
        });

        match delay {
            Some(delay) if !delay.is_zero() => {
                let inner = self.inner.clone();
                tokio::task::spawn_local(async move {
                    tokio::time::sleep(delay).await;
                    // Faults are checked again at delivery time.
                    inner.borrow_mut().deliver(envelope);
                });
            }
            _ => state.deliver(envelope),
        }
        Ok(())
    }
}

/// `N` nodes on one [`SimNetwork`], ids `1..=N`.
pub struct SimCluster {
    network: SimNetwork,
    cluster: ClusterView,
    config: PaxosConfig,
    disks: BTreeMap<NodeId, Rc<RefCell<InMemoryPaxosStorage>>>,
    handles: BTreeMap<NodeId, NodeHandle>,
}

impl SimCluster {
    /// Start `size` nodes. Must be called inside a `LocalSet`.
    pub fn start(size: u32, config: PaxosConfig) -> Result<Self, PaxosError> {
        let ids: Vec<NodeId> = (1..=size).map(NodeId::new).collect();
        let cluster = ClusterView::new(ids.clone())?;
        let mut sim = Self {
            network: SimNetwork::new(config.seed.unwrap_or(0)),
            cluster,
            config,
            disks: BTreeMap::new(),
            handles: BTreeMap::new(),
        };
        for id in ids {
            sim.spawn(id)?;
        }
        Ok(sim)
    }

    fn spawn(&mut self, id: NodeId) -> Result<(), PaxosError> {
        let disk = self.disks.entry(id).or_default().clone();
        let transport: Rc<dyn Transport> = Rc::new(self.network.clone());
        let (node, handle) = Node::new(
            id,
            self.cluster.clone(),
            self.config.clone(),
            transport,
            Box::new(disk),
            Box::new(KvStore::new()),
        )?;
        self.network.register(id, handle.mailbox());
        tokio::task::spawn_local(node.run());
        self.handles.insert(id, handle);
        Ok(())
    }

    /// The shared network.
    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    /// Every member id.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.cluster.members().to_vec()
    }

    /// Handle to a running node.
    pub fn node(&self, id: NodeId) -> Option<&NodeHandle> {
        self.handles.get(&id)
    }

    /// Handles to every running node.
    pub fn handles(&self) -> Vec<NodeHandle> {
        self.handles.values().cloned().collect()
    }

    /// A client over every running node.
    pub fn client(&self) -> PaxosClient {
        PaxosClient::new(self.handles())
    }

    /// Stop `id` and cut it off. Its disk is kept.
    pub fn crash(&mut self, id: NodeId) {
        self.network.crash(id);
        if let Some(handle) = self.handles.remove(&id) {
            handle.shutdown();
        }
    }

    /// Start `id` again from its disk.
    pub fn restart(&mut self, id: NodeId) -> Result<(), PaxosError> {
        if let Some(handle) = self.handles.remove(&id) {
            handle.shutdown();
        }
        self.network.restore(id);
        self.spawn(id)
    }

    /// Status of every running node.
    pub async fn statuses(&self) -> Vec<NodeStatus> {
        let mut statuses = Vec::new();
        for handle in self.handles.values() {
            if let Ok(status) = handle.status().await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// The ready leader with the highest ballot, polling for up to `within`.
    pub async fn wait_for_leader(&self, within: Duration) -> Option<NodeId> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let leader = self
                .statuses()
                .await
                .into_iter()
                .filter(NodeStatus::is_ready_leader)
                .max_by_key(|status| status.ballot)
                .map(|status| status.id);
            if leader.is_some() {
                return leader;
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(self.config.tick_interval).await;
        }
    }
}
