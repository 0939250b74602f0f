//! Integration tests for leader election over real TCP connections.
//!
//! Every test runs an in-process directory on an ephemeral port and spawns
//! nodes with short timeouts, then polls their status until the cluster agrees.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bully_election::{
    config::ElectionConfig,
    directory::Directory,
    identity::{PeerAddress, ProcessIdentity},
    multiplexer::{NodeConfig, NodeHandle, spawn_node},
    state::PeerState,
};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle, time::sleep};

const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(10);

fn fast_timing() -> ElectionConfig {
    ElectionConfig::new()
        .with_poll_interval(Duration::from_millis(50))
        .with_failure_timeout(Duration::from_millis(300))
        .with_probe_interval(Duration::from_millis(200))
        .with_victor_timeout(Duration::from_secs(1))
}

/// A directory plus the nodes that joined it.
struct TestCluster {
    directory: PeerAddress,
    stop_directory: oneshot::Sender<()>,
    server: JoinHandle<Result<()>>,
    nodes: Vec<NodeHandle>,
}

impl TestCluster {
    async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let directory = Directory::new(listener);
        let addr = directory.local_addr()?;
        let (stop_directory, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(directory.run_until(async {
            let _ = stopped.await;
        }));

        Ok(Self {
            directory: PeerAddress::from(addr),
            stop_directory,
            server,
            nodes: Vec::new(),
        })
    }

    /// Starts one node per identity, each joining after the previous one.
    async fn spawn(identities: &[ProcessIdentity]) -> Result<Self> {
        let mut cluster = Self::start().await?;
        for identity in identities {
            cluster.join(*identity).await?;
        }
        Ok(cluster)
    }

    fn node_config(&self, identity: ProcessIdentity) -> NodeConfig {
        NodeConfig {
            identity,
            listen_addr: "127.0.0.1:0".to_string(),
            directory: self.directory.clone(),
            election: fast_timing(),
        }
    }

    async fn join(&mut self, identity: ProcessIdentity) -> Result<()> {
        let node = spawn_node(self.node_config(identity)).await?;
        self.nodes.push(node);
        Ok(())
    }

    fn node(&self, identity: ProcessIdentity) -> &NodeHandle {
        self.nodes
            .iter()
            .find(|node| node.identity() == identity)
            .expect("node not in cluster")
    }

    /// Waits until every running node follows `expected` and only `expected`
    /// considers itself leader. Stopped nodes are skipped.
    async fn wait_for_leader(&self, expected: ProcessIdentity) -> Result<()> {
        let start = Instant::now();
        loop {
            let mut agreed = true;
            let mut leaders = Vec::new();
            for node in &self.nodes {
                let Ok(status) = node.status().await else {
                    continue;
                };
                if status.is_leader() {
                    leaders.push(status.identity);
                }
                if status.leader != Some(expected) || status.phase != PeerState::Quiescent {
                    agreed = false;
                }
            }

            if agreed && leaders == vec![expected] {
                return Ok(());
            }
            if start.elapsed() > CONVERGENCE_TIMEOUT {
                anyhow::bail!("no agreement on {expected} after {CONVERGENCE_TIMEOUT:?}, leaders: {leaders:?}");
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    async fn shutdown(self) -> Result<()> {
        for node in &self.nodes {
            let _ = node.shutdown().await;
        }
        let _ = self.stop_directory.send(());
        self.server.await??;
        Ok(())
    }
}

#[tokio::test]
async fn scenario_a_highest_days_to_birthday_wins() -> Result<()> {
    let (a, b, c) = (
        ProcessIdentity::new(10, 5),
        ProcessIdentity::new(20, 3),
        ProcessIdentity::new(15, 9),
    );
    let cluster = TestCluster::spawn(&[a, b, c]).await?;

    cluster.wait_for_leader(b).await?;

    cluster.shutdown().await
}

#[tokio::test]
async fn scenario_b_equal_birthdays_fall_back_to_id() -> Result<()> {
    let (d, e) = (ProcessIdentity::new(20, 3), ProcessIdentity::new(20, 8));
    let cluster = TestCluster::spawn(&[d, e]).await?;

    cluster.wait_for_leader(e).await?;

    cluster.shutdown().await
}

#[tokio::test]
async fn scenario_c_survivors_replace_a_dead_leader() -> Result<()> {
    let (a, b, c) = (
        ProcessIdentity::new(10, 5),
        ProcessIdentity::new(20, 3),
        ProcessIdentity::new(15, 9),
    );
    let cluster = TestCluster::spawn(&[a, b, c]).await?;
    cluster.wait_for_leader(b).await?;

    cluster.node(b).shutdown().await?;
    cluster.wait_for_leader(c).await?;

    let status = cluster.node(a).status().await?;
    assert!(!status.members.contains(&b), "dead leader still listed: {:?}", status.members);

    cluster.shutdown().await
}

#[tokio::test]
async fn manual_election_keeps_the_same_leader() -> Result<()> {
    let ids = [
        ProcessIdentity::new(3, 1),
        ProcessIdentity::new(7, 2),
        ProcessIdentity::new(5, 3),
    ];
    let cluster = TestCluster::spawn(&ids).await?;
    let highest = ProcessIdentity::new(7, 2);
    cluster.wait_for_leader(highest).await?;

    cluster.node(ProcessIdentity::new(3, 1)).start_election().await?;
    sleep(Duration::from_millis(200)).await;
    cluster.wait_for_leader(highest).await?;

    cluster.shutdown().await
}

#[tokio::test]
async fn concurrent_startup_converges_on_the_maximum() -> Result<()> {
    let mut cluster = TestCluster::start().await?;
    let ids: Vec<ProcessIdentity> = (1..=5).map(|n| ProcessIdentity::new(n % 3, n as u64)).collect();
    let highest = *ids.iter().max().context("no identities")?;

    let mut starting = Vec::new();
    for identity in &ids {
        starting.push(tokio::spawn(spawn_node(cluster.node_config(*identity))));
    }
    for task in starting {
        cluster.nodes.push(task.await??);
    }

    cluster.wait_for_leader(highest).await?;

    // The last announcements carry the full membership; give them time to land.
    let deadline = Instant::now() + CONVERGENCE_TIMEOUT;
    for identity in &ids {
        loop {
            let status = cluster.node(*identity).status().await?;
            if status.members.len() == ids.len() {
                break;
            }
            assert!(Instant::now() < deadline, "{identity} only knows {:?}", status.members);
            sleep(Duration::from_millis(50)).await;
        }
    }

    cluster.shutdown().await
}

#[tokio::test]
async fn late_joiner_with_higher_identity_takes_over() -> Result<()> {
    let low = ProcessIdentity::new(1, 1);
    let high = ProcessIdentity::new(9, 9);
    let mut cluster = TestCluster::spawn(&[low]).await?;
    cluster.wait_for_leader(low).await?;

    cluster.join(high).await?;
    cluster.wait_for_leader(high).await?;

    cluster.shutdown().await
}
