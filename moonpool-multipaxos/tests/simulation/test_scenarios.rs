//! Simulation test scenarios for multi-Paxos.
//!
//! ## Test Organization
//!
//! - Leaderless: single proposer, racing proposers, read barrier, restart
//! - Leader-based: explicit elections with injected message loss, automatic
//!   failover through `PaxosClient`, redirects, duelling candidates
//!
//! Every test runs in a `LocalSet` on a paused clock and ends with the
//! safety checks from `invariants`.

use std::future::Future;
use std::time::Duration;

use moonpool_multipaxos::messages::PeerMessage;
use moonpool_multipaxos::slot::SlotPhase;
use moonpool_multipaxos::{
    Ballot, Command, LogIndex, NodeId, NodeStatus, PaxosConfig, PaxosError, ProposalMode,
    SimCluster,
};
use tokio::task::LocalSet;

use super::invariants::{
    check_agreement, check_all, check_promise_monotonic, check_sequential_application,
};

// ============================================================================
// Test Utilities
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::INFO)
        .try_init();
}

async fn run_local<F: Future<Output = ()>>(scenario: F) {
    init_tracing();
    LocalSet::new().run_until(scenario).await;
}

fn leaderless_config() -> PaxosConfig {
    let mut config = PaxosConfig::for_simulation().with_mode(ProposalMode::Leaderless);
    config.seed = Some(7);
    config
}

/// Leader-based config whose followers never time out on their own.
fn manual_election_config() -> PaxosConfig {
    let mut config = PaxosConfig::for_simulation();
    config.heartbeat.heartbeat_timeout = Duration::from_secs(60);
    config.seed = Some(7);
    config
}

fn set(key: &str, value: &str) -> Command {
    Command::Set {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn node(id: u32) -> NodeId {
    NodeId::new(id)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}

fn status_of(statuses: &[NodeStatus], id: NodeId) -> &NodeStatus {
    statuses
        .iter()
        .find(|s| s.id == id)
        .expect("node status present")
}

// ============================================================================
// Leaderless
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_single_proposer_commits_everywhere() {
    run_local(async {
        let sim = SimCluster::start(3, leaderless_config()).expect("start");
        let node1 = sim.node(node(1)).expect("node 1");

        let result = node1.set("x", "1").await.expect("set");
        assert!(result.success);
        assert_eq!(result.value.as_deref(), Some("1"));

        settle().await;
        let statuses = sim.statuses().await;
        assert_eq!(statuses.len(), 3);
        for status in &statuses {
            let slot = status.slots.get(&LogIndex::FIRST).expect("slot 0");
            assert_eq!(slot.committed_ballot(), Some(Ballot::new(1, node(1))));
            assert_eq!(status.applied_up_to, Some(LogIndex::FIRST));
        }
        check_all(&statuses, &[set("x", "1")]);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_racing_proposers_both_succeed() {
    run_local(async {
        let sim = SimCluster::start(3, leaderless_config()).expect("start");
        let node1 = sim.node(node(1)).expect("node 1").clone();
        let node2 = sim.node(node(2)).expect("node 2").clone();

        let (a, b) = tokio::join!(node1.set("a", "1"), node2.set("b", "2"));
        a.expect("node 1 write");
        b.expect("node 2 write");

        settle().await;
        let statuses = sim.statuses().await;
        for status in &statuses {
            assert!(status.committed_value(LogIndex::new(0)).is_some());
            assert!(status.committed_value(LogIndex::new(1)).is_some());
        }
        assert_ne!(
            status_of(&statuses, node(1)).committed_value(LogIndex::new(0)),
            status_of(&statuses, node(1)).committed_value(LogIndex::new(1)),
        );
        check_all(&statuses, &[set("a", "1"), set("b", "2")]);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_writers_with_latency() {
    run_local(async {
        let mut config = leaderless_config();
        config.retry.max_attempts = 20;
        let sim = SimCluster::start(3, config).expect("start");
        sim.network()
            .set_latency(Duration::from_millis(1), Duration::from_millis(5));

        let mut proposed = Vec::new();
        let mut writes = Vec::new();
        for handle in sim.handles() {
            for i in 0..2 {
                let command = set(&format!("{}-{i}", handle.id()), &i.to_string());
                proposed.push(command.clone());
                let handle = handle.clone();
                writes.push(async move { handle.execute(command).await });
            }
        }
        for result in futures::future::join_all(writes).await {
            result.expect("write");
        }

        settle().await;
        let statuses = sim.statuses().await;
        check_all(&statuses, &proposed);
        for status in &statuses {
            assert!(status.committed().count() >= proposed.len());
        }
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_zero_retries_single_proposer_never_fails() {
    run_local(async {
        let mut config = leaderless_config();
        config.retry.max_attempts = 1;
        let sim = SimCluster::start(3, config).expect("start");
        let node1 = sim.node(node(1)).expect("node 1");

        let mut proposed = Vec::new();
        for i in 0..5 {
            let command = set("counter", &i.to_string());
            proposed.push(command.clone());
            node1.execute(command).await.expect("write");
        }

        settle().await;
        let statuses = sim.statuses().await;
        for status in &statuses {
            assert_eq!(status.applied_up_to, Some(LogIndex::new(4)));
        }
        check_all(&statuses, &proposed);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_read_barrier_sees_prior_write() {
    run_local(async {
        let sim = SimCluster::start(3, leaderless_config()).expect("start");
        let node1 = sim.node(node(1)).expect("node 1");
        let node2 = sim.node(node(2)).expect("node 2");

        node1.set("k", "v").await.expect("set");
        let value = node2.get("k").await.expect("read");
        assert_eq!(value.as_deref(), Some("v"));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_compare_and_swap() {
    run_local(async {
        let sim = SimCluster::start(3, leaderless_config()).expect("start");
        let mut client = sim.client();

        client.set("x", "a").await.expect("set");

        let hit = client
            .execute(Command::CompareAndSwap {
                key: "x".to_string(),
                expected: Some("a".to_string()),
                new_value: "b".to_string(),
            })
            .await
            .expect("cas");
        assert!(hit.success);
        assert_eq!(hit.value.as_deref(), Some("a"));

        let miss = client
            .execute(Command::CompareAndSwap {
                key: "x".to_string(),
                expected: Some("a".to_string()),
                new_value: "c".to_string(),
            })
            .await
            .expect("cas");
        assert!(!miss.success);
        assert_eq!(miss.value.as_deref(), Some("b"));

        assert_eq!(client.get("x").await.expect("get").as_deref(), Some("b"));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_minority_cannot_commit() {
    run_local(async {
        let mut config = leaderless_config();
        config.retry.max_attempts = 2;
        let sim = SimCluster::start(3, config).expect("start");
        sim.network().partition(node(1), node(2));
        sim.network().partition(node(1), node(3));

        let err = sim
            .node(node(1))
            .expect("node 1")
            .set("lonely", "1")
            .await
            .expect_err("no majority");
        assert_eq!(err, PaxosError::WriteTimeout { attempts: 2 });

        sim.network().heal_all();
        // Let node 1's hole fillers finish before writing again.
        tokio::time::sleep(Duration::from_secs(2)).await;
        sim.node(node(2))
            .expect("node 2")
            .set("after", "heal")
            .await
            .expect("majority write");

        settle().await;
        let statuses = sim.statuses().await;
        check_all(&statuses, &[set("lonely", "1"), set("after", "heal")]);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_restarted_node_replays_and_catches_up() {
    run_local(async {
        let mut sim = SimCluster::start(3, leaderless_config()).expect("start");
        let mut proposed = Vec::new();
        for i in 0..3 {
            let command = set(&format!("k{i}"), "before");
            proposed.push(command.clone());
            sim.node(node(1))
                .expect("node 1")
                .execute(command)
                .await
                .expect("write");
        }
        settle().await;

        sim.crash(node(2));
        for i in 3..5 {
            let command = set(&format!("k{i}"), "during");
            proposed.push(command.clone());
            sim.node(node(1))
                .expect("node 1")
                .execute(command)
                .await
                .expect("write while node 2 is down");
        }

        sim.restart(node(2)).expect("restart");
        let restarted = sim.node(node(2)).expect("node 2").clone();
        let status = restarted.status().await.expect("status");
        assert_eq!(status.applied_up_to, Some(LogIndex::new(2)));

        // The barrier's prepare walks node 2 over the entries it missed.
        assert_eq!(
            restarted.get("k4").await.expect("read").as_deref(),
            Some("during")
        );

        settle().await;
        let statuses = sim.statuses().await;
        check_all(&statuses, &proposed);
    })
    .await;
}

// ============================================================================
// Leader-based
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_new_leader_recommits_value_missing_on_one_node() {
    run_local(async {
        let mut sim = SimCluster::start(3, manual_election_config()).expect("start");
        let node1 = sim.node(node(1)).expect("node 1").clone();
        let node3 = sim.node(node(3)).expect("node 3").clone();

        let ballot1 = node1.elect().await.expect("node 1 elected");
        assert_eq!(ballot1, Ballot::new(1, node(1)));

        // node 3 accepts but never hears the commit.
        sim.network().drop_matching(|e| {
            e.from == NodeId::new(1)
                && e.to == NodeId::new(3)
                && matches!(e.message, PeerMessage::Commit(_))
        });
        node1.set("x", "1").await.expect("write via node 1");
        settle().await;

        let status3 = node3.status().await.expect("status");
        assert!(matches!(
            status3.slots.get(&LogIndex::FIRST).map(|s| s.phase()),
            Some(SlotPhase::Accepted { .. })
        ));
        let before = sim.statuses().await;

        sim.crash(node(1));
        sim.network().clear_drop_rules();
        let ballot3 = node3.elect().await.expect("node 3 elected");
        assert!(ballot3.is_after(&ballot1));
        settle().await;

        let survivors = sim.statuses().await;
        assert_eq!(survivors.len(), 2);
        let value0 = status_of(&survivors, node(2))
            .committed_value(LogIndex::FIRST)
            .expect("committed on node 2")
            .to_vec();
        for status in &survivors {
            let slot = status.slots.get(&LogIndex::FIRST).expect("slot 0");
            assert_eq!(slot.committed_value(), Some(value0.as_slice()));
            assert_eq!(slot.committed_ballot(), Some(ballot3));
        }
        assert_eq!(
            node3.get("x").await.expect("read").as_deref(),
            Some("1")
        );

        // The old leader comes back, follows node 3 and agrees.
        sim.restart(node(1)).expect("restart");
        settle().await;
        let after = sim.statuses().await;
        let status1 = status_of(&after, node(1));
        assert_eq!(status1.promised, ballot3);
        assert_eq!(status1.committed_value(LogIndex::FIRST), Some(value0.as_slice()));
        check_promise_monotonic(&before, &after);
        check_all(&after, &[set("x", "1")]);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_follower_redirects_to_leader() {
    run_local(async {
        let sim = SimCluster::start(3, manual_election_config()).expect("start");
        sim.node(node(1))
            .expect("node 1")
            .elect()
            .await
            .expect("elected");
        settle().await;

        let err = sim
            .node(node(2))
            .expect("node 2")
            .set("k", "v")
            .await
            .expect_err("follower refuses");
        assert_eq!(
            err,
            PaxosError::NotLeader {
                leader: Some(node(1))
            }
        );

        let mut client = sim.client();
        client.set("k", "v").await.expect("client write");
        assert_eq!(client.cached_leader(), Some(node(1)));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_duelling_candidates_leave_one_leader() {
    run_local(async {
        let sim = SimCluster::start(3, manual_election_config()).expect("start");
        let node1 = sim.node(node(1)).expect("node 1").clone();
        let node2 = sim.node(node(2)).expect("node 2").clone();

        let (a, b) = tokio::join!(node1.elect(), node2.elect());
        assert!(a.is_ok() || b.is_ok(), "someone must win: {a:?} / {b:?}");
        settle().await;

        let statuses = sim.statuses().await;
        let leaders: Vec<&NodeStatus> = statuses.iter().filter(|s| s.is_ready_leader()).collect();
        assert_eq!(leaders.len(), 1);
        let promised = leaders[0].ballot;
        for status in &statuses {
            assert_eq!(status.promised, promised);
        }
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_automatic_failover_through_client() {
    run_local(async {
        let mut sim = SimCluster::start(5, PaxosConfig::for_simulation()).expect("start");
        let mut client = sim.client();

        let leader = sim
            .wait_for_leader(Duration::from_secs(5))
            .await
            .expect("leader elected");
        let mut proposed = Vec::new();
        for i in 0..5 {
            let command = set(&format!("k{i}"), "first");
            proposed.push(command.clone());
            client.execute(command).await.expect("write");
        }

        sim.crash(leader);
        let successor = sim
            .wait_for_leader(Duration::from_secs(10))
            .await
            .expect("successor elected");
        assert_ne!(successor, leader);

        // The client still lists the dead leader and has to be redirected.
        for i in 5..10 {
            let command = set(&format!("k{i}"), "second");
            proposed.push(command.clone());
            client.execute(command).await.expect("write after failover");
        }
        for i in 0..10 {
            assert!(client.get(format!("k{i}")).await.expect("read").is_some());
        }

        settle().await;
        let statuses = sim.statuses().await;
        assert_eq!(statuses.len(), 4);
        check_agreement(&statuses);
        check_sequential_application(&statuses);
        check_all(&statuses, &proposed);
    })
    .await;
}
