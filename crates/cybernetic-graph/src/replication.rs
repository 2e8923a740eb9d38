//! Delta shipping to neighbor replicas.
//!
//! Each neighbor keeps a ledger of the stamp last shipped for every key. On
//! a tick the full replica is diffed against that ledger and the differing
//! entries go out as one [`GraphDelta`]. A ledger only advances once the
//! neighbor's inbox accepted the delta, so anything dropped is picked up by
//! a later diff without a retry queue.

use crate::replica::Replica;
use crate::store::{DeliveryError, GraphHandle};
use crate::types::{EdgeKey, GraphDelta, GraphSnapshot, ReplicaId, Stamp, Stamped, TripleKey};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub(crate) struct ShippedLedger {
    nodes: HashMap<String, Stamp>,
    edges: HashMap<EdgeKey, Stamp>,
    triples: HashMap<TripleKey, Stamp>,
}

fn differs(shipped: Option<&Stamp>, entry: &impl Stamped) -> bool {
    shipped.map_or(true, |stamp| {
        stamp.timestamp != entry.timestamp() || stamp.origin != entry.origin()
    })
}

impl ShippedLedger {
    /// Entries of `replica` this neighbor has not been sent in their current form.
    pub fn diff(&self, replica: &Replica) -> GraphSnapshot {
        GraphSnapshot {
            nodes: replica
                .nodes()
                .filter(|n| differs(self.nodes.get(&n.id), *n))
                .cloned()
                .collect(),
            edges: replica
                .edges()
                .filter(|e| differs(self.edges.get(&e.key()), *e))
                .cloned()
                .collect(),
            triples: replica
                .triples()
                .filter(|t| differs(self.triples.get(&t.key()), *t))
                .cloned()
                .collect(),
        }
    }

    /// Remember that the neighbor holds these entries.
    pub fn record(&mut self, graph: &GraphSnapshot) {
        for node in &graph.nodes {
            self.nodes.insert(node.id.clone(), node.stamp());
        }
        for edge in &graph.edges {
            self.edges.insert(edge.key(), edge.stamp());
        }
        for triple in &graph.triples {
            self.triples.insert(triple.key(), triple.stamp());
        }
    }
}

#[derive(Debug)]
struct Neighbor {
    handle: GraphHandle,
    ledger: ShippedLedger,
    /// Replica revision at the last complete shipment
    synced_revision: Option<u64>,
}

/// Outcome of one shipping round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShipReport {
    pub deltas_sent: usize,
    pub entries_sent: usize,
    pub deltas_deferred: usize,
}

#[derive(Debug)]
pub(crate) struct ReplicationChannel {
    local: ReplicaId,
    neighbors: Vec<Neighbor>,
}

impl ReplicationChannel {
    pub fn new(local: ReplicaId) -> Self {
        Self {
            local,
            neighbors: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn neighbor_ids(&self) -> Vec<ReplicaId> {
        self.neighbors
            .iter()
            .map(|n| n.handle.replica_id().to_string())
            .collect()
    }

    /// Replace the whole neighbor set. Ledgers of neighbors that stay are
    /// kept; a neighbor reached through a new store task starts over.
    pub fn replace(&mut self, handles: Vec<GraphHandle>) {
        let mut previous: HashMap<ReplicaId, Neighbor> = self
            .neighbors
            .drain(..)
            .map(|n| (n.handle.replica_id().to_string(), n))
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            let id = handle.replica_id().to_string();
            if id == self.local || !seen.insert(id.clone()) {
                continue;
            }
            let neighbor = match previous.remove(&id) {
                Some(existing) if existing.handle.same_store(&handle) => {
                    Neighbor { handle, ..existing }
                }
                Some(_) => {
                    debug!("Neighbor {} restarted, resetting its ledger", id);
                    Neighbor {
                        handle,
                        ledger: ShippedLedger::default(),
                        synced_revision: None,
                    }
                }
                None => Neighbor {
                    handle,
                    ledger: ShippedLedger::default(),
                    synced_revision: None,
                },
            };
            self.neighbors.push(neighbor);
        }
    }

    /// Entries received from a neighbor need not be sent back to it.
    pub fn observe(&mut self, delta: &GraphDelta) {
        if let Some(neighbor) = self
            .neighbors
            .iter_mut()
            .find(|n| n.handle.replica_id() == delta.from)
        {
            neighbor.ledger.record(&delta.graph);
        }
    }

    pub fn ship(&mut self, replica: &Replica) -> ShipReport {
        let revision = replica.revision();
        let mut report = ShipReport::default();

        for neighbor in &mut self.neighbors {
            if neighbor.synced_revision == Some(revision) {
                continue;
            }

            let graph = neighbor.ledger.diff(replica);
            if graph.is_empty() {
                neighbor.synced_revision = Some(revision);
                continue;
            }

            let delta = GraphDelta {
                from: self.local.clone(),
                graph: graph.clone(),
            };
            match neighbor.handle.offer_delta(delta) {
                Ok(()) => {
                    debug!(
                        "Shipped {} entries from {} to {}",
                        graph.len(),
                        self.local,
                        neighbor.handle.replica_id()
                    );
                    report.deltas_sent += 1;
                    report.entries_sent += graph.len();
                    neighbor.ledger.record(&graph);
                    neighbor.synced_revision = Some(revision);
                }
                Err(DeliveryError::Full) => {
                    warn!(
                        "Inbox of {} is full, deferring delta of {} entries",
                        neighbor.handle.replica_id(),
                        graph.len()
                    );
                    report.deltas_deferred += 1;
                }
                Err(DeliveryError::Closed) => {
                    debug!(
                        "Neighbor {} is unreachable, skipping delta",
                        neighbor.handle.replica_id()
                    );
                    report.deltas_deferred += 1;
                }
            }
        }

        report
    }
}
