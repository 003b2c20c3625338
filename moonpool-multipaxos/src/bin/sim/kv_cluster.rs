//! Binary target for the key-value cluster simulation.
//!
//! Runs a five-node leader-based cluster on the simulated network: elects a
//! leader, writes through it, crashes it, writes through its successor and
//! checks that every survivor applied the same log.
//! Exit code 1 on any failure.

use std::process;
use std::time::Duration;

use moonpool_multipaxos::{NodeStatus, PaxosConfig, PaxosError, SimCluster};

const CLUSTER_SIZE: u32 = 5;
const WRITES_PER_PHASE: usize = 10;

async fn run_scenario() -> Result<Vec<NodeStatus>, PaxosError> {
    let mut config = PaxosConfig::for_simulation();
    config.seed = Some(42);
    let mut sim = SimCluster::start(CLUSTER_SIZE, config)?;
    let mut client = sim.client();

    let leader = sim
        .wait_for_leader(Duration::from_secs(5))
        .await
        .ok_or_else(|| PaxosError::InvalidState("no leader elected".to_string()))?;
    eprintln!("leader elected: {leader}");

    for i in 0..WRITES_PER_PHASE {
        client.set(format!("key-{i}"), format!("v{i}")).await?;
    }
    eprintln!("wrote {WRITES_PER_PHASE} keys");

    sim.crash(leader);
    eprintln!("crashed {leader}");

    let successor = sim
        .wait_for_leader(Duration::from_secs(10))
        .await
        .ok_or_else(|| PaxosError::InvalidState("no successor elected".to_string()))?;
    eprintln!("successor elected: {successor}");

    let mut client = sim.client();
    for i in WRITES_PER_PHASE..2 * WRITES_PER_PHASE {
        client.set(format!("key-{i}"), format!("v{i}")).await?;
    }
    for i in 0..2 * WRITES_PER_PHASE {
        let value = client.get(format!("key-{i}")).await?;
        if value.as_deref() != Some(format!("v{i}").as_str()) {
            return Err(PaxosError::InvalidState(format!(
                "key-{i} read back as {value:?}"
            )));
        }
    }
    eprintln!("read back {} keys", 2 * WRITES_PER_PHASE);

    // Let the last commits and catch-up settle.
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(sim.statuses().await)
}

fn check_agreement(statuses: &[NodeStatus]) -> Result<(), String> {
    for a in statuses {
        for b in statuses {
            for (index, value) in a.committed() {
                if let Some(other) = b.committed_value(index) {
                    if other != value {
                        return Err(format!("{} and {} disagree at {index}", a.id, b.id));
                    }
                }
            }
        }
    }
    Ok(())
}

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    eprintln!("=== KV Cluster: Leader Failover ===");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("Failed to build local runtime");
    let local = tokio::task::LocalSet::new();

    let statuses = match local.block_on(&runtime, run_scenario()) {
        Ok(statuses) => statuses,
        Err(e) => {
            eprintln!("FAILED: {e}");
            process::exit(1);
        }
    };

    for status in &statuses {
        eprintln!(
            "{} role={} promised={} applied_up_to={:?}",
            status.id, status.role, status.promised, status.applied_up_to
        );
    }
    if let Err(e) = check_agreement(&statuses) {
        eprintln!("FAILED: {e}");
        process::exit(1);
    }
    eprintln!("PASSED");
}
