//! Data model of the replicated graph.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a replica (one per cluster node).
pub type ReplicaId = String;

/// Caller-supplied metadata attached to nodes, edges and triples.
pub type Metadata = serde_json::Map<String, Value>;

/// Ordering key used for last-write-wins arbitration.
///
/// Timestamps compare first; the origin replica breaks ties so that equal
/// timestamps resolve identically on every replica.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub timestamp: i64,
    pub origin: ReplicaId,
}

/// Entries that carry a write stamp.
pub trait Stamped {
    fn timestamp(&self) -> i64;
    fn origin(&self) -> &str;

    /// True when `self` should replace `other` under last-write-wins.
    fn supersedes(&self, other: &Self) -> bool {
        (self.timestamp(), self.origin()) > (other.timestamp(), other.origin())
    }

    fn stamp(&self) -> Stamp {
        Stamp {
            timestamp: self.timestamp(),
            origin: self.origin().to_string(),
        }
    }
}

/// A graph vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub metadata: Metadata,
    pub timestamp: i64,
    /// Write sequence number on the originating replica
    pub version: u64,
    pub origin: ReplicaId,
}

/// A directed edge, keyed by `(from, to)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub metadata: Metadata,
    pub timestamp: i64,
    /// Write sequence number on the originating replica
    pub version: u64,
    pub origin: ReplicaId,
}

impl Edge {
    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            from: self.from.clone(),
            to: self.to.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeKey {
    pub from: String,
    pub to: String,
}

/// Write metadata of a triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripleMeta {
    pub timestamp: i64,
    pub origin: ReplicaId,
    #[serde(default)]
    pub attributes: Metadata,
}

/// A subject/predicate/object relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub meta: TripleMeta,
}

impl Triple {
    pub fn key(&self) -> TripleKey {
        TripleKey {
            subject: self.subject.clone(),
            predicate: self.predicate.clone(),
            object: self.object.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TripleKey {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

impl Stamped for Node {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn origin(&self) -> &str {
        &self.origin
    }
}

impl Stamped for Edge {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn origin(&self) -> &str {
        &self.origin
    }
}

impl Stamped for Triple {
    fn timestamp(&self) -> i64 {
        self.meta.timestamp
    }

    fn origin(&self) -> &str {
        &self.meta.origin
    }
}

/// Which adjacency index to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

/// Sorted export of graph contents. Also the payload of a delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub triples: Vec<Triple>,
}

impl GraphSnapshot {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty() && self.triples.is_empty()
    }

    /// Total number of entries carried.
    pub fn len(&self) -> usize {
        self.nodes.len() + self.edges.len() + self.triples.len()
    }
}

/// Full export of one replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaState {
    pub replica_id: ReplicaId,
    /// Bumped to `max(local, remote) + 1` on every merge
    pub version: u64,
    pub neighbors: Vec<ReplicaId>,
    pub graph: GraphSnapshot,
}

/// Entries shipped from one replica to a neighbor on a sync tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDelta {
    pub from: ReplicaId,
    pub graph: GraphSnapshot,
}

/// Counts of entries a merge accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub nodes_applied: usize,
    pub edges_applied: usize,
    pub triples_applied: usize,
}

impl MergeStats {
    pub fn total(&self) -> usize {
        self.nodes_applied + self.edges_applied + self.triples_applied
    }
}

/// Diagnostic counters of a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub replica_id: ReplicaId,
    pub nodes: usize,
    pub edges: usize,
    pub triples: usize,
    pub neighbors: usize,
    pub version: u64,
    pub merges: u64,
    pub deltas_shipped: u64,
    pub deltas_received: u64,
}

/// Key/value filter over triples.
///
/// Recognized keys are `subject`, `predicate`, `object` (string equality) and
/// `meta` (an object whose every field must match the triple's metadata).
/// Any other key is ignored, and an empty query matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TripleQuery(BTreeMap<String, Value>);

impl TripleQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(criteria: BTreeMap<String, Value>) -> Self {
        Self(criteria)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn subject(self, subject: impl Into<String>) -> Self {
        self.with("subject", subject.into())
    }

    pub fn predicate(self, predicate: impl Into<String>) -> Self {
        self.with("predicate", predicate.into())
    }

    pub fn object(self, object: impl Into<String>) -> Self {
        self.with("object", object.into())
    }

    /// Require a metadata field to equal `value`.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let entry = self
            .0
            .entry("meta".to_string())
            .or_insert_with(|| Value::Object(Metadata::new()));
        if let Value::Object(fields) = entry {
            fields.insert(key.into(), value.into());
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// String criterion for `key`, if one is set.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn matches(&self, triple: &Triple) -> bool {
        self.0.iter().all(|(key, expected)| match key.as_str() {
            "subject" => expected.as_str() == Some(triple.subject.as_str()),
            "predicate" => expected.as_str() == Some(triple.predicate.as_str()),
            "object" => expected.as_str() == Some(triple.object.as_str()),
            "meta" => match expected {
                Value::Object(fields) => fields
                    .iter()
                    .all(|(field, value)| meta_field_matches(&triple.meta, field, value)),
                _ => true,
            },
            _ => true,
        })
    }
}

fn meta_field_matches(meta: &TripleMeta, field: &str, expected: &Value) -> bool {
    match field {
        "timestamp" => expected.as_i64() == Some(meta.timestamp),
        "origin" => expected.as_str() == Some(meta.origin.as_str()),
        _ => meta.attributes.get(field) == Some(expected),
    }
}

/// Kind of entity a lookup missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Node,
    Edge,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Node => write!(f, "node"),
            EntityKind::Edge => write!(f, "edge"),
        }
    }
}
