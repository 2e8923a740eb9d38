//! Replicated graph and triple store.
//!
//! Each cluster node runs one [`GraphStore`] task holding its replica of the
//! shared graph: nodes, directed edges with adjacency indexes, and
//! subject/predicate/object triples. Writes are applied locally at once and
//! shipped to neighbor replicas on a fixed tick; every replica merges what it
//! receives under last-write-wins, so replicas that saw the same writes hold
//! the same contents.
//!
//! ```ignore
//! use cybernetic_graph::{GraphConfig, GraphStore, TripleQuery};
//!
//! let a = GraphStore::spawn("node-a", GraphConfig::default());
//! let b = GraphStore::spawn("node-b", GraphConfig::default());
//! a.set_neighbors(vec![b.clone()]).await?;
//!
//! a.put_triple("alice", "likes", "pizza", Default::default()).await?;
//! // after the next sync tick
//! let triples = b.query(TripleQuery::new().subject("alice")).await?;
//! ```

pub mod clock;
pub mod error;
pub mod replica;
pub mod replication;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{GraphError, Result};
pub use replica::Replica;
pub use replication::ShipReport;
pub use store::{GraphConfig, GraphHandle, GraphStore};
pub use types::{
    Direction, Edge, EdgeKey, EntityKind, GraphDelta, GraphSnapshot, MergeStats, Metadata, Node,
    ReplicaId, ReplicaState, Stamp, Stamped, StoreStats, Triple, TripleKey, TripleMeta,
    TripleQuery,
};
