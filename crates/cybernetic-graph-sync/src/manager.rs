/// Background manager keeping the replication neighbor set in line with cluster membership
use cybernetic_config::ClusterSection;
use cybernetic_graph::{GraphHandle, ReplicaId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::membership::{InstanceLocator, Membership, MembershipEvent};

/// Configuration for the sync manager
#[derive(Debug, Clone)]
pub struct SyncManagerConfig {
    /// Well-known component name of the graph store on every peer
    pub component: String,
    /// Delay before the first discovery pass
    pub settle_delay: Duration,
    /// Delay between a node-up event and rediscovery
    pub rejoin_delay: Duration,
    /// Merge the state of newly wired neighbors into the local replica
    pub bootstrap_on_wire: bool,
    /// Bound on a single peer lookup
    pub lookup_timeout: Duration,
    /// Bound on calls through a [`ClusterSyncHandle`]
    pub call_timeout: Duration,
}

impl Default for SyncManagerConfig {
    fn default() -> Self {
        Self::from(&ClusterSection::default())
    }
}

impl From<&ClusterSection> for SyncManagerConfig {
    fn from(config: &ClusterSection) -> Self {
        Self {
            component: config.component.clone(),
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            rejoin_delay: Duration::from_millis(config.rejoin_delay_ms),
            bootstrap_on_wire: config.bootstrap_on_wire,
            lookup_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
        }
    }
}

/// Wiring state of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Uninitialized,
    /// Looking for peers; the permanent state of a single-node deployment
    Wiring,
    Synced,
}

/// Snapshot of the manager for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub neighbors: Vec<ReplicaId>,
    pub discovery_passes: u64,
}

enum SyncCommand {
    EnableSync { reply: oneshot::Sender<SyncStatus> },
    Status { reply: oneshot::Sender<SyncStatus> },
    Shutdown,
}

/// Handle to a running [`ClusterSyncManager`].
#[derive(Clone)]
pub struct ClusterSyncHandle {
    tx: mpsc::Sender<SyncCommand>,
    call_timeout: Duration,
}

impl ClusterSyncHandle {
    async fn call(
        &self,
        command: impl FnOnce(oneshot::Sender<SyncStatus>) -> SyncCommand,
    ) -> Result<SyncStatus> {
        let (reply, response) = oneshot::channel();
        let request = async move {
            self.tx
                .send(command(reply))
                .await
                .map_err(|_| SyncError::Unavailable)?;
            response.await.map_err(|_| SyncError::Unavailable)
        };
        time::timeout(self.call_timeout, request)
            .await
            .map_err(|_| SyncError::Timeout(self.call_timeout))?
    }

    /// Force a discovery pass now and report the resulting status.
    pub async fn enable_sync(&self) -> Result<SyncStatus> {
        self.call(|reply| SyncCommand::EnableSync { reply }).await
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        self.call(|reply| SyncCommand::Status { reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(SyncCommand::Shutdown)
            .await
            .map_err(|_| SyncError::Unavailable)
    }
}

/// Discovers peer graph stores and installs them as the local store's
/// replication neighbors, rewiring when nodes join.
pub struct ClusterSyncManager {
    graph: GraphHandle,
    membership: Arc<dyn Membership>,
    locator: Arc<dyn InstanceLocator>,
    config: SyncManagerConfig,
    state: SyncState,
    neighbors: Vec<ReplicaId>,
    discovery_passes: u64,
    next_discovery: Option<Instant>,
}

impl ClusterSyncManager {
    pub fn new(
        graph: GraphHandle,
        membership: Arc<dyn Membership>,
        locator: Arc<dyn InstanceLocator>,
        config: SyncManagerConfig,
    ) -> Self {
        Self {
            graph,
            membership,
            locator,
            config,
            state: SyncState::Uninitialized,
            neighbors: Vec::new(),
            discovery_passes: 0,
            next_discovery: None,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Spawn the manager on the current runtime.
    pub fn start(mut self) -> ClusterSyncHandle {
        let (tx, rx) = mpsc::channel(16);
        let events = self.membership.subscribe();

        self.state = SyncState::Wiring;
        self.schedule_discovery(self.config.settle_delay);
        info!(
            "Starting cluster sync manager on {} (first discovery in {:?})",
            self.membership.local_peer(),
            self.config.settle_delay
        );

        let call_timeout = self.config.call_timeout;
        tokio::spawn(self.run(rx, events));
        ClusterSyncHandle { tx, call_timeout }
    }

    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<SyncCommand>,
        events: broadcast::Receiver<MembershipEvent>,
    ) {
        let mut events = Some(events);

        loop {
            let deadline = self.next_discovery;
            tokio::select! {
                command = inbox.recv() => match command {
                    Some(SyncCommand::EnableSync { reply }) => {
                        self.next_discovery = None;
                        self.discover().await;
                        let _ = reply.send(self.status());
                    }
                    Some(SyncCommand::Status { reply }) => {
                        let _ = reply.send(self.status());
                    }
                    Some(SyncCommand::Shutdown) | None => break,
                },
                event = next_event(&mut events) => match event {
                    Ok(event) => self.on_membership_event(event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} membership events, rediscovering", missed);
                        self.schedule_discovery(self.config.rejoin_delay);
                    }
                    Err(RecvError::Closed) => {
                        debug!("Membership feed closed");
                        events = None;
                    }
                },
                _ = sleep_until(deadline) => {
                    self.next_discovery = None;
                    self.discover().await;
                }
            }
        }

        info!(
            "Cluster sync manager on {} stopped",
            self.membership.local_peer()
        );
    }

    fn status(&self) -> SyncStatus {
        SyncStatus {
            state: self.state,
            neighbors: self.neighbors.clone(),
            discovery_passes: self.discovery_passes,
        }
    }

    /// Keep the earliest pending discovery.
    fn schedule_discovery(&mut self, delay: Duration) {
        let at = Instant::now() + delay;
        self.next_discovery = Some(match self.next_discovery {
            Some(pending) if pending <= at => pending,
            _ => at,
        });
    }

    fn on_membership_event(&mut self, event: MembershipEvent) {
        match event {
            MembershipEvent::NodeUp(peer) if peer != self.membership.local_peer() => {
                info!("Node {} is up, rewiring in {:?}", peer, self.config.rejoin_delay);
                self.state = SyncState::Wiring;
                self.schedule_discovery(self.config.rejoin_delay);
            }
            MembershipEvent::NodeDown(peer) => {
                // The store stops reaching it on its own; the next pass drops it.
                info!("Node {} is down", peer);
            }
            MembershipEvent::NodeUp(_) => {}
        }
    }

    async fn discover(&mut self) {
        self.discovery_passes += 1;
        let peers = self.membership.reachable_peers().await;
        debug!(
            "Discovery pass {} on {}: {} reachable peers",
            self.discovery_passes,
            self.membership.local_peer(),
            peers.len()
        );

        let mut candidates = Vec::with_capacity(peers.len());
        for peer in &peers {
            let lookup = self.locator.locate(peer, &self.config.component);
            match time::timeout(self.config.lookup_timeout, lookup).await {
                Ok(Ok(handle)) => candidates.push(handle),
                Ok(Err(err)) => warn!("Could not locate graph store on {}: {}", peer, err),
                Err(_) => warn!("{}", SyncError::LookupTimeout(peer.clone())),
            }
        }

        if candidates.is_empty() {
            debug!(
                "No graph stores found from {}, staying in wiring",
                self.membership.local_peer()
            );
            return;
        }

        if let Err(err) = self.graph.set_neighbors(candidates.clone()).await {
            warn!("Failed to install neighbors: {}", err);
            return;
        }

        let previous: HashSet<ReplicaId> = self.neighbors.drain(..).collect();
        self.neighbors = candidates
            .iter()
            .map(|handle| handle.replica_id().to_string())
            .collect();
        self.state = SyncState::Synced;
        info!(
            "{} synced with neighbors {:?}",
            self.membership.local_peer(),
            self.neighbors
        );

        if self.config.bootstrap_on_wire {
            let fresh = candidates
                .iter()
                .filter(|handle| !previous.contains(handle.replica_id()));
            for neighbor in fresh {
                self.bootstrap_from(neighbor).await;
            }
        }
    }

    async fn bootstrap_from(&self, neighbor: &GraphHandle) {
        let merged = match neighbor.get_state().await {
            Ok(remote) => self.graph.merge(remote).await,
            Err(err) => Err(err),
        };
        match merged {
            Ok(state) => debug!(
                "Bootstrapped from {}, replica now at version {}",
                neighbor.replica_id(),
                state.version
            ),
            Err(err) => warn!(
                "Bootstrap from {} failed: {}",
                neighbor.replica_id(),
                err
            ),
        }
    }
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<MembershipEvent>>,
) -> std::result::Result<MembershipEvent, RecvError> {
    match events {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalCluster;
    use crate::membership::StaticMembership;
    use cybernetic_graph::{GraphConfig, GraphStore, Metadata, TripleQuery};

    const COMPONENT: &str = "graph_store";

    fn config() -> SyncManagerConfig {
        SyncManagerConfig {
            component: COMPONENT.to_string(),
            settle_delay: Duration::from_millis(100),
            rejoin_delay: Duration::from_millis(200),
            bootstrap_on_wire: true,
            lookup_timeout: Duration::from_secs(1),
            call_timeout: Duration::from_secs(5),
        }
    }

    async fn node(cluster: &LocalCluster, id: &str) -> (GraphHandle, ClusterSyncHandle) {
        let graph = GraphStore::spawn(id, GraphConfig::default());
        cluster.join(id, COMPONENT, graph.clone()).await;
        let manager = ClusterSyncManager::new(
            graph.clone(),
            Arc::new(cluster.membership(id)),
            Arc::new(cluster.clone()),
            config(),
        );
        (graph, manager.start())
    }

    #[test]
    fn config_from_section() {
        let section = ClusterSection {
            settle_delay_ms: 10,
            ..ClusterSection::default()
        };
        let config = SyncManagerConfig::from(&section);
        assert_eq!(config.settle_delay, Duration::from_millis(10));
        assert_eq!(config.component, "graph_store");
    }

    #[tokio::test(start_paused = true)]
    async fn lone_node_stays_wiring() {
        let cluster = LocalCluster::new();
        let graph = GraphStore::spawn("a", GraphConfig::default());
        let manager = ClusterSyncManager::new(
            graph,
            Arc::new(cluster.membership("a")),
            Arc::new(cluster.clone()),
            config(),
        );
        assert_eq!(manager.state(), SyncState::Uninitialized);
        let handle = manager.start();

        time::sleep(Duration::from_secs(1)).await;
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, SyncState::Wiring);
        assert_eq!(status.discovery_passes, 1);
        assert!(status.neighbors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn first_pass_wires_existing_peers() {
        let cluster = LocalCluster::new();
        let (_a, manager_a) = node(&cluster, "a").await;
        let (b, _manager_b) = node(&cluster, "b").await;

        time::sleep(Duration::from_millis(500)).await;
        let status = manager_a.status().await.unwrap();
        assert_eq!(status.state, SyncState::Synced);
        assert_eq!(status.neighbors, vec!["b".to_string()]);
        assert_eq!(b.neighbors().await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn node_down_keeps_synced() {
        let cluster = LocalCluster::new();
        let (_a, manager_a) = node(&cluster, "a").await;
        let (b, manager_b) = node(&cluster, "b").await;
        time::sleep(Duration::from_millis(500)).await;

        manager_b.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
        cluster.leave("b").await;
        time::sleep(Duration::from_millis(500)).await;

        let status = manager_a.status().await.unwrap();
        assert_eq!(status.state, SyncState::Synced);
    }

    #[tokio::test(start_paused = true)]
    async fn enable_sync_rediscovers_on_demand() {
        let cluster = LocalCluster::new();
        let static_view = StaticMembership::new("a", vec!["b".to_string()]);
        let graph = GraphStore::spawn("a", GraphConfig::default());
        let handle = ClusterSyncManager::new(
            graph.clone(),
            Arc::new(static_view),
            Arc::new(cluster.clone()),
            SyncManagerConfig {
                settle_delay: Duration::from_secs(3600),
                ..config()
            },
        )
        .start();

        let status = handle.enable_sync().await.unwrap();
        assert_eq!(status.state, SyncState::Wiring);

        // static peers never announce themselves
        let b = GraphStore::spawn("b", GraphConfig::default());
        cluster.join("b", COMPONENT, b.clone()).await;
        b.put_triple("bob", "likes", "pasta", Metadata::new())
            .await
            .unwrap();

        let status = handle.enable_sync().await.unwrap();
        assert_eq!(status.state, SyncState::Synced);
        assert_eq!(status.discovery_passes, 2);

        // bootstrap pulled b's contents
        let triples = graph.query(TripleQuery::new()).await.unwrap();
        assert_eq!(triples.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_rediscovery_keeps_current_wiring() {
        let cluster = LocalCluster::new();
        let (_a, manager_a) = node(&cluster, "a").await;
        let (_b, _manager_b) = node(&cluster, "b").await;
        time::sleep(Duration::from_millis(500)).await;

        cluster.leave("b").await;
        let status = manager_a.enable_sync().await.unwrap();
        assert_eq!(status.state, SyncState::Synced);
        assert_eq!(status.neighbors, vec!["b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn calls_to_a_stalled_manager_time_out() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ClusterSyncHandle {
            tx,
            call_timeout: Duration::from_millis(100),
        };
        assert_eq!(
            handle.status().await.unwrap_err(),
            SyncError::Timeout(Duration::from_millis(100))
        );
    }
}
