//! In-process cluster registry.
//!
//! [`LocalCluster`] plays the host runtime for nodes living in one process:
//! nodes join with the handles of their components, every node gets a
//! [`LocalMembership`] view, and the cluster itself resolves component
//! lookups. Cloning shares the same registry.

use async_trait::async_trait;
use cybernetic_graph::GraphHandle;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

use crate::error::{Result, SyncError};
use crate::membership::{InstanceLocator, Membership, MembershipEvent, PeerId};

const EVENT_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct LocalCluster {
    nodes: Arc<RwLock<HashMap<PeerId, HashMap<String, GraphHandle>>>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCluster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            nodes: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Register a node with one component and announce it.
    pub async fn join(&self, peer: impl Into<PeerId>, component: &str, handle: GraphHandle) {
        let peer = peer.into();
        let is_new = {
            let mut nodes = self.nodes.write().await;
            let is_new = !nodes.contains_key(&peer);
            nodes
                .entry(peer.clone())
                .or_default()
                .insert(component.to_string(), handle);
            is_new
        };

        if is_new {
            info!("Node {} joined the local cluster", peer);
            let _ = self.events.send(MembershipEvent::NodeUp(peer));
        }
    }

    /// Remove a node and announce its departure.
    pub async fn leave(&self, peer: &str) {
        let removed = self.nodes.write().await.remove(peer).is_some();
        if removed {
            info!("Node {} left the local cluster", peer);
            let _ = self.events.send(MembershipEvent::NodeDown(peer.to_string()));
        }
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.nodes.read().await.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Membership view of the cluster as seen by `local`.
    pub fn membership(&self, local: impl Into<PeerId>) -> LocalMembership {
        LocalMembership {
            cluster: self.clone(),
            local: local.into(),
        }
    }
}

#[async_trait]
impl InstanceLocator for LocalCluster {
    async fn locate(&self, peer: &str, component: &str) -> Result<GraphHandle> {
        let nodes = self.nodes.read().await;
        let components = nodes
            .get(peer)
            .ok_or_else(|| SyncError::PeerNotFound(peer.to_string()))?;
        components
            .get(component)
            .filter(|handle| !handle.is_closed())
            .cloned()
            .ok_or_else(|| SyncError::ComponentNotFound {
                peer: peer.to_string(),
                component: component.to_string(),
            })
    }
}

/// One node's view of a [`LocalCluster`].
#[derive(Clone)]
pub struct LocalMembership {
    cluster: LocalCluster,
    local: PeerId,
}

#[async_trait]
impl Membership for LocalMembership {
    fn local_peer(&self) -> &str {
        &self.local
    }

    async fn reachable_peers(&self) -> Vec<PeerId> {
        self.cluster
            .peers()
            .await
            .into_iter()
            .filter(|peer| *peer != self.local)
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.cluster.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cybernetic_graph::{GraphConfig, GraphStore};

    #[tokio::test]
    async fn join_and_leave_emit_events() {
        let cluster = LocalCluster::new();
        let view = cluster.membership("a");
        let mut events = view.subscribe();

        let b = GraphStore::spawn("b", GraphConfig::default());
        cluster.join("b", "graph_store", b.clone()).await;
        // re-registering does not announce twice
        cluster.join("b", "graph_store", b).await;
        cluster.leave("b").await;

        assert_eq!(
            events.recv().await.unwrap(),
            MembershipEvent::NodeUp("b".to_string())
        );
        assert_eq!(
            events.recv().await.unwrap(),
            MembershipEvent::NodeDown("b".to_string())
        );
    }

    #[tokio::test]
    async fn locate_resolves_registered_components() {
        let cluster = LocalCluster::new();
        let a = GraphStore::spawn("a", GraphConfig::default());
        cluster.join("a", "graph_store", a).await;

        let handle = cluster.locate("a", "graph_store").await.unwrap();
        assert_eq!(handle.replica_id(), "a");

        assert_eq!(
            cluster.locate("a", "cache").await.unwrap_err(),
            SyncError::ComponentNotFound {
                peer: "a".to_string(),
                component: "cache".to_string()
            }
        );
        assert_eq!(
            cluster.locate("zzz", "graph_store").await.unwrap_err(),
            SyncError::PeerNotFound("zzz".to_string())
        );
    }

    #[tokio::test]
    async fn membership_view_hides_local_node() {
        let cluster = LocalCluster::new();
        for id in ["a", "b", "c"] {
            cluster
                .join(id, "graph_store", GraphStore::spawn(id, GraphConfig::default()))
                .await;
        }
        assert_eq!(
            cluster.membership("b").reachable_peers().await,
            vec!["a".to_string(), "c".to_string()]
        );
    }
}
