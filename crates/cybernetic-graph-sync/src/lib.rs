//! Cluster synchronization wiring for the replicated graph.
//!
//! The [`ClusterSyncManager`] keeps the local graph store's neighbor set in
//! line with cluster membership. It never ships data itself; it finds the
//! graph stores of reachable peers and installs them, all at once, as the
//! store's replication neighbors.
//!
//! # Features
//!
//! - **Pluggable discovery**: membership comes from any [`Membership`]
//!   implementation (static configuration, in-process cluster, registry).
//! - **Topology tolerant**: node-up events trigger a delayed rewiring pass,
//!   node-down events need no action.
//! - **Single-node friendly**: with no reachable peers the manager simply
//!   stays in [`SyncState::Wiring`].
//!
//! ```ignore
//! use cybernetic_graph_sync::{ClusterSyncManager, LocalCluster, SyncManagerConfig};
//!
//! let cluster = LocalCluster::new();
//! cluster.join("node-a", "graph_store", graph.clone()).await;
//! let manager = ClusterSyncManager::new(
//!     graph,
//!     Arc::new(cluster.membership("node-a")),
//!     Arc::new(cluster.clone()),
//!     SyncManagerConfig::default(),
//! )
//! .start();
//! ```

pub mod error;
pub mod local;
pub mod manager;
pub mod membership;

pub use error::{Result, SyncError};
pub use local::{LocalCluster, LocalMembership};
pub use manager::{ClusterSyncHandle, ClusterSyncManager, SyncManagerConfig, SyncState, SyncStatus};
pub use membership::{InstanceLocator, Membership, MembershipEvent, PeerId, StaticMembership};
