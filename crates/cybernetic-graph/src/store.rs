//! The replicated graph store actor.
//!
//! [`GraphStore::spawn`] starts one task that owns a [`Replica`] and its
//! replication channel. Every operation is a message on the task's bounded
//! inbox, processed strictly in arrival order; [`GraphHandle`] is the cheap,
//! cloneable way to send them.

use crate::clock::{Clock, SystemClock};
use crate::error::{GraphError, Result};
use crate::replica::Replica;
use crate::replication::ReplicationChannel;
use crate::types::{
    Direction, Edge, EntityKind, GraphDelta, Metadata, Node, ReplicaId, ReplicaState, StoreStats,
    Triple, TripleQuery,
};
use cybernetic_config::GraphSection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Runtime settings of a graph store.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub inbox_capacity: usize,
    pub call_timeout: Duration,
    pub sync_interval: Duration,
    pub debounce: Duration,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self::from(&GraphSection::default())
    }
}

impl From<&GraphSection> for GraphConfig {
    fn from(section: &GraphSection) -> Self {
        Self {
            inbox_capacity: section.inbox_capacity.max(1),
            call_timeout: Duration::from_millis(section.call_timeout_ms),
            sync_interval: Duration::from_millis(section.sync_interval_ms.max(1)),
            debounce: Duration::from_millis(section.debounce_ms),
        }
    }
}

/// Messages accepted by the store task.
#[derive(Debug)]
pub(crate) enum GraphCommand {
    AddNode {
        id: String,
        metadata: Metadata,
        reply: oneshot::Sender<Node>,
    },
    AddEdge {
        from: String,
        to: String,
        metadata: Metadata,
        reply: oneshot::Sender<Edge>,
    },
    GetNode {
        id: String,
        reply: oneshot::Sender<Option<Node>>,
    },
    GetEdge {
        from: String,
        to: String,
        reply: oneshot::Sender<Option<Edge>>,
    },
    Adjacent {
        id: String,
        direction: Direction,
        reply: oneshot::Sender<Vec<String>>,
    },
    PutTriple {
        subject: String,
        predicate: String,
        object: String,
        attributes: Metadata,
    },
    Query {
        criteria: TripleQuery,
        reply: oneshot::Sender<Vec<Triple>>,
    },
    Merge {
        remote: Box<ReplicaState>,
        reply: oneshot::Sender<ReplicaState>,
    },
    ApplyDelta(GraphDelta),
    GetState {
        reply: oneshot::Sender<ReplicaState>,
    },
    SetNeighbors {
        neighbors: Vec<GraphHandle>,
        reply: oneshot::Sender<()>,
    },
    Neighbors {
        reply: oneshot::Sender<Vec<ReplicaId>>,
    },
    SyncNow {
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<StoreStats>,
    },
    Shutdown,
}

/// Why a delta could not be handed to a neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryError {
    Full,
    Closed,
}

/// Handle to a running graph store.
#[derive(Clone, Debug)]
pub struct GraphHandle {
    replica_id: Arc<str>,
    tx: mpsc::Sender<GraphCommand>,
    call_timeout: Duration,
}

impl GraphHandle {
    pub(crate) fn from_parts(
        replica_id: ReplicaId,
        tx: mpsc::Sender<GraphCommand>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            replica_id: Arc::from(replica_id),
            tx,
            call_timeout,
        }
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    /// True once the store task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// True when both handles reach the same store task.
    pub fn same_store(&self, other: &GraphHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    fn unavailable(&self) -> GraphError {
        GraphError::Unavailable(self.replica_id.to_string())
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> GraphCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        let request = async move {
            self.tx
                .send(command(reply))
                .await
                .map_err(|_| self.unavailable())?;
            response.await.map_err(|_| self.unavailable())
        };
        time::timeout(self.call_timeout, request)
            .await
            .map_err(|_| GraphError::Timeout(self.call_timeout))?
    }

    async fn cast(&self, command: GraphCommand) -> Result<()> {
        self.tx.send(command).await.map_err(|_| self.unavailable())
    }

    pub(crate) fn offer_delta(&self, delta: GraphDelta) -> std::result::Result<(), DeliveryError> {
        self.tx
            .try_send(GraphCommand::ApplyDelta(delta))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
                mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
            })
    }

    /// Create or overwrite a node.
    pub async fn add_node(&self, id: impl Into<String>, metadata: Metadata) -> Result<Node> {
        let id = id.into();
        self.call(|reply| GraphCommand::AddNode { id, metadata, reply })
            .await
    }

    /// Create or overwrite the edge `(from, to)`.
    pub async fn add_edge(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        metadata: Metadata,
    ) -> Result<Edge> {
        let (from, to) = (from.into(), to.into());
        self.call(|reply| GraphCommand::AddEdge {
            from,
            to,
            metadata,
            reply,
        })
        .await
    }

    pub async fn get_node(&self, id: &str) -> Result<Node> {
        let key = id.to_string();
        self.call(|reply| GraphCommand::GetNode { id: key, reply })
            .await?
            .ok_or_else(|| GraphError::NotFound {
                kind: EntityKind::Node,
                key: id.to_string(),
            })
    }

    pub async fn get_edge(&self, from: &str, to: &str) -> Result<Edge> {
        let (f, t) = (from.to_string(), to.to_string());
        self.call(|reply| GraphCommand::GetEdge {
            from: f,
            to: t,
            reply,
        })
        .await?
        .ok_or_else(|| GraphError::NotFound {
            kind: EntityKind::Edge,
            key: format!("{} -> {}", from, to),
        })
    }

    async fn adjacent(&self, id: &str, direction: Direction) -> Result<Vec<String>> {
        let id = id.to_string();
        self.call(|reply| GraphCommand::Adjacent {
            id,
            direction,
            reply,
        })
        .await
    }

    pub async fn get_outgoing_neighbors(&self, id: &str) -> Result<Vec<String>> {
        self.adjacent(id, Direction::Outgoing).await
    }

    pub async fn get_incoming_neighbors(&self, id: &str) -> Result<Vec<String>> {
        self.adjacent(id, Direction::Incoming).await
    }

    /// Deduplicated union of outgoing and incoming neighbors.
    pub async fn get_all_neighbors(&self, id: &str) -> Result<Vec<String>> {
        self.adjacent(id, Direction::Both).await
    }

    /// Store a triple without waiting for it to be applied.
    pub async fn put_triple(
        &self,
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
        attributes: Metadata,
    ) -> Result<()> {
        self.cast(GraphCommand::PutTriple {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            attributes,
        })
        .await
    }

    pub async fn query(&self, criteria: TripleQuery) -> Result<Vec<Triple>> {
        self.call(|reply| GraphCommand::Query { criteria, reply })
            .await
    }

    /// Merge a remote state under last-write-wins and return the result.
    pub async fn merge(&self, remote: ReplicaState) -> Result<ReplicaState> {
        let remote = Box::new(remote);
        self.call(|reply| GraphCommand::Merge { remote, reply })
            .await
    }

    pub async fn get_state(&self) -> Result<ReplicaState> {
        self.call(|reply| GraphCommand::GetState { reply }).await
    }

    /// Atomically replace the set of replicas receiving this store's deltas.
    pub async fn set_neighbors(&self, neighbors: Vec<GraphHandle>) -> Result<()> {
        self.call(|reply| GraphCommand::SetNeighbors { neighbors, reply })
            .await
    }

    pub async fn neighbors(&self) -> Result<Vec<ReplicaId>> {
        self.call(|reply| GraphCommand::Neighbors { reply }).await
    }

    /// Ship pending deltas now, ignoring the debounce window. Returns the
    /// number of deltas handed to neighbors.
    pub async fn sync_now(&self) -> Result<usize> {
        self.call(|reply| GraphCommand::SyncNow { reply }).await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.call(|reply| GraphCommand::Stats { reply }).await
    }

    /// Stop the store task. Queued messages ahead of this one are still served.
    pub async fn shutdown(&self) -> Result<()> {
        self.cast(GraphCommand::Shutdown).await
    }
}

/// Task state of one replica.
pub struct GraphStore {
    replica: Replica,
    channel: ReplicationChannel,
    config: GraphConfig,
    last_local_write: Option<Instant>,
    deferred: bool,
    merges: u64,
    deltas_shipped: u64,
    deltas_received: u64,
}

impl GraphStore {
    /// Spawn a store on the current tokio runtime using the system clock.
    pub fn spawn(replica_id: impl Into<ReplicaId>, config: GraphConfig) -> GraphHandle {
        Self::spawn_with_clock(replica_id, config, Arc::new(SystemClock))
    }

    pub fn spawn_with_clock(
        replica_id: impl Into<ReplicaId>,
        config: GraphConfig,
        clock: Arc<dyn Clock>,
    ) -> GraphHandle {
        let replica_id = replica_id.into();
        let (tx, rx) = mpsc::channel(config.inbox_capacity);
        let handle = GraphHandle::from_parts(replica_id.clone(), tx, config.call_timeout);

        let store = GraphStore {
            replica: Replica::new(replica_id.clone(), clock),
            channel: ReplicationChannel::new(replica_id),
            config,
            last_local_write: None,
            deferred: false,
            merges: 0,
            deltas_shipped: 0,
            deltas_received: 0,
        };
        tokio::spawn(store.run(rx));
        handle
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<GraphCommand>) {
        info!(
            "Starting graph store {} with sync interval {:?}",
            self.replica.id(),
            self.config.sync_interval
        );

        let mut ticker = time::interval_at(
            Instant::now() + self.config.sync_interval,
            self.config.sync_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = inbox.recv() => match command {
                    Some(GraphCommand::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                _ = ticker.tick() => self.on_tick(),
            }
        }

        info!("Graph store {} stopped", self.replica.id());
    }

    fn touch(&mut self) {
        self.last_local_write = Some(Instant::now());
    }

    fn handle(&mut self, command: GraphCommand) {
        match command {
            GraphCommand::AddNode {
                id,
                metadata,
                reply,
            } => {
                let node = self.replica.add_node(id, metadata);
                self.touch();
                let _ = reply.send(node);
            }
            GraphCommand::AddEdge {
                from,
                to,
                metadata,
                reply,
            } => {
                let edge = self.replica.add_edge(from, to, metadata);
                self.touch();
                let _ = reply.send(edge);
            }
            GraphCommand::GetNode { id, reply } => {
                let _ = reply.send(self.replica.node(&id).cloned());
            }
            GraphCommand::GetEdge { from, to, reply } => {
                let _ = reply.send(self.replica.edge(&from, &to).cloned());
            }
            GraphCommand::Adjacent {
                id,
                direction,
                reply,
            } => {
                let _ = reply.send(self.replica.neighbors(&id, direction));
            }
            GraphCommand::PutTriple {
                subject,
                predicate,
                object,
                attributes,
            } => {
                self.replica
                    .put_triple(subject, predicate, object, attributes);
                self.touch();
            }
            GraphCommand::Query { criteria, reply } => {
                let _ = reply.send(self.replica.query(&criteria));
            }
            GraphCommand::Merge { remote, reply } => {
                let stats = self.replica.merge_state(&remote);
                self.merges += 1;
                debug!(
                    "Merged state of {} into {}: {} nodes, {} edges, {} triples applied",
                    remote.replica_id,
                    self.replica.id(),
                    stats.nodes_applied,
                    stats.edges_applied,
                    stats.triples_applied
                );
                let _ = reply.send(self.replica.state(self.channel.neighbor_ids()));
            }
            GraphCommand::ApplyDelta(delta) => {
                let stats = self.replica.merge_snapshot(&delta.graph);
                self.channel.observe(&delta);
                self.deltas_received += 1;
                debug!(
                    "Applied delta from {} to {}: {} of {} entries won",
                    delta.from,
                    self.replica.id(),
                    stats.total(),
                    delta.graph.len()
                );
            }
            GraphCommand::GetState { reply } => {
                let _ = reply.send(self.replica.state(self.channel.neighbor_ids()));
            }
            GraphCommand::SetNeighbors { neighbors, reply } => {
                self.channel.replace(neighbors);
                info!(
                    "Graph store {} now replicates to {:?}",
                    self.replica.id(),
                    self.channel.neighbor_ids()
                );
                let _ = reply.send(());
            }
            GraphCommand::Neighbors { reply } => {
                let _ = reply.send(self.channel.neighbor_ids());
            }
            GraphCommand::SyncNow { reply } => {
                let sent = self.ship();
                let _ = reply.send(sent);
            }
            GraphCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            GraphCommand::Shutdown => {}
        }
    }

    /// Ship on a tick unless a write burst is still in progress. A burst
    /// postpones shipping by one tick at most.
    fn on_tick(&mut self) {
        let bursting = self
            .last_local_write
            .is_some_and(|at| at.elapsed() < self.config.debounce);
        if bursting && !self.deferred {
            self.deferred = true;
            debug!("Deferring sync of {} during write burst", self.replica.id());
            return;
        }
        self.deferred = false;
        self.ship();
    }

    fn ship(&mut self) -> usize {
        if self.channel.len() == 0 {
            return 0;
        }
        let report = self.channel.ship(&self.replica);
        self.deltas_shipped += report.deltas_sent as u64;
        report.deltas_sent
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            replica_id: self.replica.id().to_string(),
            nodes: self.replica.node_count(),
            edges: self.replica.edge_count(),
            triples: self.replica.triple_count(),
            neighbors: self.channel.len(),
            version: self.replica.version(),
            merges: self.merges,
            deltas_shipped: self.deltas_shipped,
            deltas_received: self.deltas_received,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn meta(value: serde_json::Value) -> Metadata {
        value.as_object().cloned().unwrap_or_default()
    }

    fn spawn(id: &str, clock: &ManualClock) -> GraphHandle {
        GraphStore::spawn_with_clock(id, GraphConfig::default(), Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn node_round_trip_and_not_found() {
        let store = spawn("a", &ManualClock::new(100));
        let node = store.add_node("x", meta(json!({"color": "red"}))).await.unwrap();
        assert_eq!(node.timestamp, 100);
        assert_eq!(store.get_node("x").await.unwrap(), node);

        let err = store.get_node("missing").await.unwrap_err();
        assert!(err.is_not_found());
        let err = store.get_edge("x", "y").await.unwrap_err();
        assert_eq!(
            err,
            GraphError::NotFound {
                kind: EntityKind::Edge,
                key: "x -> y".to_string()
            }
        );
    }

    #[tokio::test]
    async fn neighbors_follow_edges() {
        let store = spawn("a", &ManualClock::new(1));
        store.add_edge("a", "b", Metadata::new()).await.unwrap();
        store.add_edge("c", "a", Metadata::new()).await.unwrap();
        store.add_edge("b", "a", Metadata::new()).await.unwrap();

        assert_eq!(store.get_outgoing_neighbors("a").await.unwrap(), vec!["b"]);
        assert_eq!(
            store.get_incoming_neighbors("a").await.unwrap(),
            vec!["b", "c"]
        );
        assert_eq!(store.get_all_neighbors("a").await.unwrap(), vec!["b", "c"]);
        assert!(store.get_all_neighbors("zzz").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn put_triple_is_visible_to_later_queries() {
        let store = spawn("a", &ManualClock::new(1));
        store
            .put_triple("alice", "likes", "pizza", meta(json!({"source": "chat"})))
            .await
            .unwrap();
        store
            .put_triple("bob", "likes", "pasta", Metadata::new())
            .await
            .unwrap();

        assert_eq!(store.query(TripleQuery::new()).await.unwrap().len(), 2);
        let alice = store
            .query(TripleQuery::new().subject("alice"))
            .await
            .unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].meta.attributes["source"], "chat");
        assert_eq!(alice[0].meta.origin, "a");
    }

    #[tokio::test]
    async fn merge_returns_merged_state() {
        let clock = ManualClock::new(100);
        let a = spawn("a", &clock);
        let b = spawn("b", &clock);
        a.add_node("x", meta(json!({"color": "red"}))).await.unwrap();
        clock.set(200);
        b.add_node("x", meta(json!({"color": "blue"}))).await.unwrap();

        let merged = a.merge(b.get_state().await.unwrap()).await.unwrap();
        assert_eq!(merged.replica_id, "a");
        assert_eq!(merged.version, 1);
        assert_eq!(merged.graph.nodes[0].metadata["color"], "blue");
        assert_eq!(a.stats().await.unwrap().merges, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deltas_reach_neighbors_on_tick() {
        let clock = ManualClock::new(100);
        let a = spawn("a", &clock);
        let b = spawn("b", &clock);
        a.set_neighbors(vec![b.clone()]).await.unwrap();
        assert_eq!(a.neighbors().await.unwrap(), vec!["b".to_string()]);

        a.put_triple("alice", "likes", "pizza", Metadata::new())
            .await
            .unwrap();
        assert!(b.query(TripleQuery::new()).await.unwrap().is_empty());

        time::sleep(Duration::from_millis(2_500)).await;
        let triples = b.query(TripleQuery::new()).await.unwrap();
        assert_eq!(triples.len(), 1);
        assert_eq!(triples[0].subject, "alice");
        assert_eq!(b.stats().await.unwrap().deltas_received, 1);
    }

    #[tokio::test]
    async fn sync_now_ships_immediately() {
        let clock = ManualClock::new(1);
        let a = spawn("a", &clock);
        let b = spawn("b", &clock);
        a.set_neighbors(vec![b.clone()]).await.unwrap();
        a.add_node("x", Metadata::new()).await.unwrap();

        assert_eq!(a.sync_now().await.unwrap(), 1);
        assert_eq!(a.sync_now().await.unwrap(), 0);
        assert!(b.get_node("x").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn calls_time_out_when_store_is_stuck() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = GraphHandle::from_parts("stuck".into(), tx, Duration::from_millis(50));
        let err = handle.get_state().await.unwrap_err();
        assert_eq!(err, GraphError::Timeout(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn stopped_store_is_unavailable() {
        let store = spawn("a", &ManualClock::new(1));
        store.shutdown().await.unwrap();
        let err = loop {
            match store.get_state().await {
                Err(err) => break err,
                Ok(_) => tokio::task::yield_now().await,
            }
        };
        assert_eq!(err, GraphError::Unavailable("a".to_string()));
        assert!(store.is_closed());
    }
}
