use cybernetic_graph::GraphError;
use std::time::Duration;

use crate::membership::PeerId;

/// Error types for discovery and wiring.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Peer not reachable: {0}")]
    PeerNotFound(PeerId),

    #[error("Component {component} not running on peer {peer}")]
    ComponentNotFound { peer: PeerId, component: String },

    #[error("Lookup of peer {0} timed out")]
    LookupTimeout(PeerId),

    #[error("Graph store error: {0}")]
    Graph(#[from] GraphError),

    #[error("Cluster sync manager call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cluster sync manager is unavailable")]
    Unavailable,
}

pub type Result<T> = std::result::Result<T, SyncError>;
