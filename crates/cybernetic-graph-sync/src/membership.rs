//! Interfaces to the host membership facility and remote instance lookup.

use async_trait::async_trait;
use cybernetic_graph::GraphHandle;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;

/// Identifier of a cluster node.
pub type PeerId = String;

/// Topology change notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipEvent {
    NodeUp(PeerId),
    NodeDown(PeerId),
}

/// Source of cluster membership for one node.
#[async_trait]
pub trait Membership: Send + Sync {
    /// The node this view belongs to.
    fn local_peer(&self) -> &str;

    /// Peers currently reachable from this node, excluding itself.
    async fn reachable_peers(&self) -> Vec<PeerId>;

    /// Feed of node-up/node-down events.
    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}

/// Resolves a peer's component by its well-known name.
#[async_trait]
pub trait InstanceLocator: Send + Sync {
    async fn locate(&self, peer: &str, component: &str) -> Result<GraphHandle>;
}

/// A fixed peer list, typically from configuration. Never emits events.
pub struct StaticMembership {
    local: PeerId,
    peers: Vec<PeerId>,
    events: broadcast::Sender<MembershipEvent>,
}

impl StaticMembership {
    pub fn new(local: impl Into<PeerId>, peers: Vec<PeerId>) -> Self {
        let (events, _) = broadcast::channel(1);
        Self {
            local: local.into(),
            peers,
            events,
        }
    }
}

#[async_trait]
impl Membership for StaticMembership {
    fn local_peer(&self) -> &str {
        &self.local
    }

    async fn reachable_peers(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|peer| **peer != self.local)
            .cloned()
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}
