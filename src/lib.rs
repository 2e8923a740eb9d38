//! Cybernetic: a replicated graph and triple store for clustered nodes.
//!
//! This crate re-exports the component crates and adds [`NodeRuntime`], the
//! wiring that runs one node's graph store, query cache and cluster sync
//! manager together.

pub mod runtime;

pub use cybernetic_config as config;
pub use cybernetic_graph as graph;
pub use cybernetic_graph_sync as sync;
pub use cybernetic_query_cache as cache;

pub use runtime::{NodeRuntime, NodeStatus};
