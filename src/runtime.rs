//! One node's components, started and stopped together.

use anyhow::{Context, Result};
use cybernetic_config::AppConfig;
use cybernetic_graph::{GraphConfig, GraphHandle, GraphStore, Metadata, StoreStats, Triple, TripleQuery};
use cybernetic_graph_sync::{
    ClusterSyncHandle, ClusterSyncManager, InstanceLocator, LocalCluster, Membership,
    SyncManagerConfig, SyncStatus,
};
use cybernetic_query_cache::{
    CacheLookup, CacheStats, InvalidationPattern, QueryCache, QueryCacheConfig, QueryKey,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

const TRIPLE_QUERY: &str = "triples";

/// Combined diagnostics of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub replica_id: String,
    pub graph: StoreStats,
    pub cache: CacheStats,
    pub sync: SyncStatus,
}

/// A running node: graph store, query cache and sync manager.
#[derive(Clone)]
pub struct NodeRuntime {
    replica_id: String,
    graph: GraphHandle,
    cache: QueryCache<Vec<Triple>>,
    sync: ClusterSyncHandle,
}

impl NodeRuntime {
    /// Start a node against the given membership and locator.
    pub fn start(
        replica_id: impl Into<String>,
        config: &AppConfig,
        membership: Arc<dyn Membership>,
        locator: Arc<dyn InstanceLocator>,
    ) -> Self {
        let replica_id = replica_id.into();
        let graph = GraphStore::spawn(replica_id.clone(), GraphConfig::from(&config.graph));
        Self::assemble(replica_id, graph, config, membership, locator)
    }

    /// Start a node as a member of an in-process cluster.
    pub async fn join_local(
        cluster: &LocalCluster,
        replica_id: impl Into<String>,
        config: &AppConfig,
    ) -> Self {
        let replica_id = replica_id.into();
        let graph = GraphStore::spawn(replica_id.clone(), GraphConfig::from(&config.graph));
        cluster
            .join(replica_id.clone(), &config.cluster.component, graph.clone())
            .await;
        let membership = Arc::new(cluster.membership(replica_id.clone()));
        Self::assemble(replica_id, graph, config, membership, Arc::new(cluster.clone()))
    }

    /// Start a single node on a private in-process cluster.
    ///
    /// No other process can reach it, so its sync manager stays in
    /// `Wiring`; replicating across processes needs a locator over a
    /// transport, passed to [`NodeRuntime::start`].
    pub async fn standalone(config: &AppConfig) -> Self {
        Self::join_local(&LocalCluster::new(), config.replica_id(), config).await
    }

    fn assemble(
        replica_id: String,
        graph: GraphHandle,
        config: &AppConfig,
        membership: Arc<dyn Membership>,
        locator: Arc<dyn InstanceLocator>,
    ) -> Self {
        let cache = QueryCache::spawn(QueryCacheConfig::from(&config.cache));
        let sync = ClusterSyncManager::new(
            graph.clone(),
            membership,
            locator,
            SyncManagerConfig::from(&config.cluster),
        )
        .start();
        info!("Node {} started", replica_id);

        Self {
            replica_id,
            graph,
            cache,
            sync,
        }
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn graph(&self) -> &GraphHandle {
        &self.graph
    }

    pub fn cache(&self) -> &QueryCache<Vec<Triple>> {
        &self.cache
    }

    pub fn sync(&self) -> &ClusterSyncHandle {
        &self.sync
    }

    /// Store a triple and drop cached results it could change.
    pub async fn put_triple(
        &self,
        subject: &str,
        predicate: &str,
        object: &str,
        attributes: Metadata,
    ) -> Result<()> {
        self.graph
            .put_triple(subject, predicate, object, attributes)
            .await
            .context("storing triple")?;
        let removed = self
            .cache
            .invalidate_pattern(InvalidationPattern::Triple {
                subject: subject.to_string(),
                predicate: predicate.to_string(),
                object: object.to_string(),
            })
            .await
            .context("invalidating cached queries")?;
        if removed > 0 {
            debug!("Write to {} invalidated {} cached queries", subject, removed);
        }
        Ok(())
    }

    /// Triple query served from the cache when possible.
    ///
    /// Writes merged in from other replicas do not invalidate the cache, so
    /// results may lag them by up to the cache TTL.
    pub async fn query_cached(&self, criteria: TripleQuery) -> Result<Vec<Triple>> {
        let key = cache_key(&criteria)?;
        if let CacheLookup::Hit(triples) = self.cache.get(&key).await.context("reading cache")? {
            return Ok(triples);
        }

        let triples = self
            .graph
            .query(criteria)
            .await
            .context("querying graph store")?;
        self.cache
            .put(key, triples.clone())
            .await
            .context("filling cache")?;
        Ok(triples)
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        Ok(NodeStatus {
            replica_id: self.replica_id.clone(),
            graph: self.graph.stats().await.context("graph store stats")?,
            cache: self.cache.stats().await.context("query cache stats")?,
            sync: self.sync.status().await.context("sync manager status")?,
        })
    }

    /// Stop all components. Already stopped components are ignored.
    pub async fn shutdown(&self) {
        let _ = self.sync.shutdown().await;
        let _ = self.cache.shutdown().await;
        let _ = self.graph.shutdown().await;
        info!("Node {} stopped", self.replica_id);
    }
}

/// Cache key for a triple query: the canonical criteria plus the bound
/// positions, so writes can invalidate it precisely.
fn cache_key(criteria: &TripleQuery) -> Result<QueryKey> {
    let fingerprint = serde_json::to_string(criteria).context("encoding query criteria")?;
    let mut key = QueryKey::new(format!("{}:{}", TRIPLE_QUERY, fingerprint));
    if let Some(subject) = criteria.get_str("subject") {
        key = key.subject(subject);
    }
    if let Some(predicate) = criteria.get_str("predicate") {
        key = key.predicate(predicate);
    }
    if let Some(object) = criteria.get_str("object") {
        key = key.object(object);
    }
    Ok(key)
}
