//! In-memory replica state and the last-write-wins merge.
//!
//! A [`Replica`] is plain data with no synchronization of its own: it is
//! owned by exactly one store task, which applies operations in arrival
//! order. Adjacency indexes are derived from the edge set and only ever
//! updated alongside it.

use crate::clock::Clock;
use crate::types::{
    Direction, Edge, EdgeKey, GraphSnapshot, MergeStats, Metadata, Node, ReplicaId, ReplicaState,
    Stamped, Triple, TripleKey, TripleMeta, TripleQuery,
};
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::Arc;

#[derive(Debug)]
pub struct Replica {
    id: ReplicaId,
    clock: Arc<dyn Clock>,
    /// Merge marker, `max(local, remote) + 1` per merge
    version: u64,
    /// Local write sequence
    write_seq: u64,
    last_timestamp: i64,
    /// Bumped on every applied change, local or merged
    revision: u64,
    nodes: HashMap<String, Node>,
    edges: HashMap<EdgeKey, Edge>,
    triples: HashMap<TripleKey, Triple>,
    outgoing: HashMap<String, BTreeSet<String>>,
    incoming: HashMap<String, BTreeSet<String>>,
}

impl Replica {
    pub fn new(id: impl Into<ReplicaId>, clock: Arc<dyn Clock>) -> Self {
        Self {
            id: id.into(),
            clock,
            version: 0,
            write_seq: 0,
            last_timestamp: i64::MIN,
            revision: 0,
            nodes: HashMap::new(),
            edges: HashMap::new(),
            triples: HashMap::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn triple_count(&self) -> usize {
        self.triples.len()
    }

    /// Next local write timestamp, strictly increasing on this replica.
    fn next_timestamp(&mut self) -> (i64, u64) {
        let timestamp = self.clock.now_ms().max(self.last_timestamp.saturating_add(1));
        self.last_timestamp = timestamp;
        self.write_seq += 1;
        self.revision += 1;
        (timestamp, self.write_seq)
    }

    pub fn add_node(&mut self, id: String, metadata: Metadata) -> Node {
        let (timestamp, version) = self.next_timestamp();
        let node = Node {
            id: id.clone(),
            metadata,
            timestamp,
            version,
            origin: self.id.clone(),
        };
        self.nodes.insert(id, node.clone());
        node
    }

    pub fn add_edge(&mut self, from: String, to: String, metadata: Metadata) -> Edge {
        let (timestamp, version) = self.next_timestamp();
        let edge = Edge {
            from,
            to,
            metadata,
            timestamp,
            version,
            origin: self.id.clone(),
        };
        self.insert_edge(edge.clone());
        edge
    }

    pub fn put_triple(
        &mut self,
        subject: String,
        predicate: String,
        object: String,
        attributes: Metadata,
    ) -> Triple {
        let (timestamp, _) = self.next_timestamp();
        let triple = Triple {
            subject,
            predicate,
            object,
            meta: TripleMeta {
                timestamp,
                origin: self.id.clone(),
                attributes,
            },
        };
        self.triples.insert(triple.key(), triple.clone());
        triple
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn edge(&self, from: &str, to: &str) -> Option<&Edge> {
        self.edges.get(&EdgeKey {
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    /// Sorted neighbor ids; unknown ids have none.
    pub fn neighbors(&self, id: &str, direction: Direction) -> Vec<String> {
        let empty = BTreeSet::new();
        let outgoing = self.outgoing.get(id).unwrap_or(&empty);
        let incoming = self.incoming.get(id).unwrap_or(&empty);
        match direction {
            Direction::Outgoing => outgoing.iter().cloned().collect(),
            Direction::Incoming => incoming.iter().cloned().collect(),
            Direction::Both => outgoing.union(incoming).cloned().collect(),
        }
    }

    /// Triples matching `criteria`, sorted by key.
    pub fn query(&self, criteria: &TripleQuery) -> Vec<Triple> {
        let mut matches: Vec<Triple> = self
            .triples
            .values()
            .filter(|triple| criteria.matches(triple))
            .cloned()
            .collect();
        matches.sort_by_key(Triple::key);
        matches
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let mut nodes: Vec<Node> = self.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let mut edges: Vec<Edge> = self.edges.values().cloned().collect();
        edges.sort_by_key(Edge::key);
        GraphSnapshot {
            nodes,
            edges,
            triples: self.query(&TripleQuery::new()),
        }
    }

    pub fn state(&self, neighbors: Vec<ReplicaId>) -> ReplicaState {
        ReplicaState {
            replica_id: self.id.clone(),
            version: self.version,
            neighbors,
            graph: self.snapshot(),
        }
    }

    /// Merge a full remote state and bump the replica version.
    pub fn merge_state(&mut self, remote: &ReplicaState) -> MergeStats {
        let stats = self.merge_snapshot(&remote.graph);
        self.version = self.version.max(remote.version) + 1;
        stats
    }

    /// Apply every remote entry that wins under last-write-wins.
    ///
    /// Local stamps are advanced past every remote stamp seen, so a later
    /// local write supersedes what was merged even on a lagging clock.
    pub fn merge_snapshot(&mut self, remote: &GraphSnapshot) -> MergeStats {
        self.observe_remote(remote);

        let nodes_applied = merge_entries(
            &mut self.nodes,
            remote.nodes.iter().map(|n| (n.id.clone(), n)),
        );

        let mut edges_applied = 0;
        for edge in &remote.edges {
            let wins = self
                .edges
                .get(&edge.key())
                .map_or(true, |local| edge.supersedes(local));
            if wins {
                self.insert_edge(edge.clone());
                edges_applied += 1;
            }
        }

        let triples_applied = merge_entries(
            &mut self.triples,
            remote.triples.iter().map(|t| (t.key(), t)),
        );

        let stats = MergeStats {
            nodes_applied,
            edges_applied,
            triples_applied,
        };
        if stats.total() > 0 {
            self.revision += 1;
        }
        stats
    }

    fn observe_remote(&mut self, remote: &GraphSnapshot) {
        let newest = remote
            .nodes
            .iter()
            .map(Stamped::timestamp)
            .chain(remote.edges.iter().map(Stamped::timestamp))
            .chain(remote.triples.iter().map(Stamped::timestamp))
            .max();
        if let Some(newest) = newest {
            self.last_timestamp = self.last_timestamp.max(newest);
        }
    }

    fn insert_edge(&mut self, edge: Edge) {
        self.outgoing
            .entry(edge.from.clone())
            .or_default()
            .insert(edge.to.clone());
        self.incoming
            .entry(edge.to.clone())
            .or_default()
            .insert(edge.from.clone());
        self.edges.insert(edge.key(), edge);
    }

    pub(crate) fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub(crate) fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub(crate) fn triples(&self) -> impl Iterator<Item = &Triple> {
        self.triples.values()
    }
}

fn merge_entries<'a, K, V>(
    local: &mut HashMap<K, V>,
    remote: impl Iterator<Item = (K, &'a V)>,
) -> usize
where
    K: Eq + Hash,
    V: Stamped + Clone + 'a,
{
    let mut applied = 0;
    for (key, incoming) in remote {
        let wins = local
            .get(&key)
            .map_or(true, |current| incoming.supersedes(current));
        if wins {
            local.insert(key, incoming.clone());
            applied += 1;
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn meta(value: serde_json::Value) -> Metadata {
        value.as_object().cloned().unwrap_or_default()
    }

    fn replica(id: &str, clock: &ManualClock) -> Replica {
        Replica::new(id, Arc::new(clock.clone()))
    }

    #[test]
    fn local_timestamps_are_strictly_increasing() {
        let clock = ManualClock::new(100);
        let mut r = replica("a", &clock);
        let first = r.add_node("x".into(), Metadata::new());
        let second = r.add_node("x".into(), Metadata::new());
        assert_eq!(first.timestamp, 100);
        assert_eq!(second.timestamp, 101);
        assert_eq!(second.version, 2);
        assert_eq!(r.node("x").unwrap().timestamp, 101);
    }

    #[test]
    fn add_edge_updates_both_indexes() {
        let clock = ManualClock::new(1);
        let mut r = replica("a", &clock);
        r.add_edge("a".into(), "b".into(), Metadata::new());
        r.add_edge("c".into(), "a".into(), Metadata::new());
        r.add_edge("a".into(), "c".into(), Metadata::new());

        assert_eq!(r.neighbors("a", Direction::Outgoing), vec!["b", "c"]);
        assert_eq!(r.neighbors("a", Direction::Incoming), vec!["c"]);
        assert_eq!(r.neighbors("a", Direction::Both), vec!["b", "c"]);
        assert_eq!(r.neighbors("b", Direction::Incoming), vec!["a"]);
        assert!(r.neighbors("missing", Direction::Both).is_empty());
    }

    #[test]
    fn rewriting_a_triple_overwrites_in_place() {
        let clock = ManualClock::new(1);
        let mut r = replica("a", &clock);
        r.put_triple("alice".into(), "likes".into(), "pizza".into(), meta(json!({"n": 1})));
        r.put_triple("alice".into(), "likes".into(), "pizza".into(), meta(json!({"n": 2})));

        let all = r.query(&TripleQuery::new());
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].meta.attributes["n"], 2);
    }

    #[test]
    fn later_write_wins_in_either_order() {
        let clock_a = ManualClock::new(100);
        let clock_b = ManualClock::new(200);
        let mut a = replica("a", &clock_a);
        let mut b = replica("b", &clock_b);
        a.add_node("x".into(), meta(json!({"color": "red"})));
        b.add_node("x".into(), meta(json!({"color": "blue"})));

        let state_a = a.state(vec![]);
        let state_b = b.state(vec![]);

        let mut forward = replica("c", &ManualClock::new(0));
        forward.merge_state(&state_a);
        forward.merge_state(&state_b);

        let mut backward = replica("d", &ManualClock::new(0));
        backward.merge_state(&state_b);
        backward.merge_state(&state_a);

        assert_eq!(forward.node("x").unwrap().metadata["color"], "blue");
        assert_eq!(backward.node("x").unwrap().metadata["color"], "blue");
        assert_eq!(forward.snapshot(), backward.snapshot());
    }

    #[test]
    fn equal_timestamps_resolve_by_origin() {
        let clock = ManualClock::new(100);
        let mut a = replica("a", &clock);
        let mut b = replica("b", &clock);
        a.add_node("x".into(), meta(json!({"from": "a"})));
        b.add_node("x".into(), meta(json!({"from": "b"})));

        let state_a = a.state(vec![]);
        let state_b = b.state(vec![]);
        a.merge_state(&state_b);
        b.merge_state(&state_a);

        assert_eq!(a.node("x").unwrap().metadata["from"], "b");
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn local_write_after_merge_beats_newer_remote_on_slow_clock() {
        let mut a = replica("a", &ManualClock::new(100));
        let mut b = replica("b", &ManualClock::new(200));
        b.add_node("x".into(), meta(json!({"color": "blue"})));
        a.merge_state(&b.state(vec![]));

        let written = a.add_node("x".into(), meta(json!({"color": "red"})));
        assert_eq!(written.timestamp, 201);
        b.merge_state(&a.state(vec![]));

        assert_eq!(a.node("x").unwrap().metadata["color"], "red");
        assert_eq!(b.node("x").unwrap().metadata["color"], "red");
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn merge_is_idempotent_and_bumps_version() {
        let clock = ManualClock::new(1);
        let mut a = replica("a", &clock);
        a.put_triple("s".into(), "p".into(), "o".into(), Metadata::new());
        let state = a.state(vec![]);

        let mut b = replica("b", &clock);
        let first = b.merge_state(&state);
        let revision = b.revision();
        let second = b.merge_state(&state);

        assert_eq!(first.triples_applied, 1);
        assert_eq!(second.total(), 0);
        assert_eq!(b.revision(), revision);
        assert_eq!(b.version(), 2);
    }

    #[test]
    fn merged_edges_are_indexed() {
        let clock = ManualClock::new(1);
        let mut a = replica("a", &clock);
        a.add_edge("x".into(), "y".into(), Metadata::new());

        let mut b = replica("b", &clock);
        b.merge_snapshot(&a.snapshot());

        assert!(b.edge("x", "y").is_some());
        assert_eq!(b.neighbors("x", Direction::Outgoing), vec!["y"]);
        assert_eq!(b.neighbors("y", Direction::Incoming), vec!["x"]);
    }

    #[test]
    fn adjacency_matches_edge_set() {
        let clock = ManualClock::new(1);
        let mut r = replica("a", &clock);
        for (from, to) in [("a", "b"), ("b", "c"), ("a", "b"), ("c", "a")] {
            r.add_edge(from.into(), to.into(), Metadata::new());
        }

        for edge in r.edges() {
            assert!(r.neighbors(&edge.from, Direction::Outgoing).contains(&edge.to));
            assert!(r.neighbors(&edge.to, Direction::Incoming).contains(&edge.from));
        }
        for (from, targets) in &r.outgoing {
            for to in targets {
                assert!(r.edge(from, to).is_some());
            }
        }
        for (to, sources) in &r.incoming {
            for from in sources {
                assert!(r.edge(from, to).is_some());
            }
        }
    }
}
