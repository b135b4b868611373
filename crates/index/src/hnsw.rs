//! Hierarchical navigable small-world graph over cosine distance.
//!
//! Node ids are assigned monotonically, so ascending id order is insertion
//! order; every ranking breaks distance ties on it. Deletion is a tombstone:
//! deleted nodes still route searches but never appear in results until the
//! graph is compacted.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashSet};

use serde::{Deserialize, Serialize};

use kbase_core::{check_dimension, cosine_distance, AnnParams, Result};

const MAX_LEVEL: u8 = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    vector: Vec<f32>,
    neighbors: Vec<Vec<u32>>,
    deleted: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub distance: f32,
    pub id: u32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
            .then(self.id.cmp(&other.id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswGraph {
    m: usize,
    m_max0: usize,
    ef_construction: usize,
    level_mult: f64,
    dimension: usize,
    nodes: BTreeMap<u32, Node>,
    entry_point: Option<u32>,
    level_max: u8,
    next_id: u32,
    rng_state: u64,
}

impl HnswGraph {
    pub fn new(dimension: usize, params: AnnParams) -> Self {
        let m = params.m.max(2);
        Self {
            m,
            m_max0: m * 2,
            ef_construction: params.ef_construction.max(1),
            level_mult: 1.0 / (m as f64).ln(),
            dimension,
            nodes: BTreeMap::new(),
            entry_point: None,
            level_max: 0,
            next_id: 0,
            rng_state: 42,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn live_len(&self) -> usize {
        self.nodes.values().filter(|node| !node.deleted).count()
    }

    pub fn tombstones(&self) -> usize {
        self.nodes.values().filter(|node| node.deleted).count()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.nodes.get(&id).map(|node| !node.deleted).unwrap_or(false)
    }

    /// Inserts a vector and returns its assigned id.
    pub fn insert(&mut self, vector: Vec<f32>) -> Result<u32> {
        check_dimension(&vector, self.dimension)?;
        let id = self.next_id;
        self.insert_with_id(id, vector);
        self.next_id = id + 1;
        Ok(id)
    }

    pub fn mark_deleted(&mut self, id: u32) -> bool {
        match self.nodes.get_mut(&id) {
            Some(node) if !node.deleted => {
                node.deleted = true;
                true
            }
            _ => false,
        }
    }

    /// Approximate k nearest live nodes, ascending by distance then id.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<Candidate> {
        let Some(mut ep) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }
        for level in (1..=self.level_max).rev() {
            ep = self.greedy_closest(ep, query, level);
        }
        self.search_layer(ep, query, ef.max(k), 0)
            .into_iter()
            .filter(|candidate| self.contains(candidate.id))
            .take(k)
            .collect()
    }

    /// Exhaustive ranking over live nodes accepted by `filter`.
    pub fn exact<F>(&self, query: &[f32], k: usize, filter: F) -> Vec<Candidate>
    where
        F: Fn(u32) -> bool,
    {
        if k == 0 {
            return Vec::new();
        }
        let mut scored: Vec<Candidate> = self
            .nodes
            .iter()
            .filter(|(id, node)| !node.deleted && filter(**id))
            .map(|(id, node)| Candidate {
                distance: cosine_distance(&node.vector, query),
                id: *id,
            })
            .collect();
        scored.sort();
        scored.truncate(k);
        scored
    }

    /// Rebuilds the graph from live nodes in id order, keeping their ids.
    pub fn compacted(&self) -> HnswGraph {
        let mut rebuilt = HnswGraph {
            m: self.m,
            m_max0: self.m_max0,
            ef_construction: self.ef_construction,
            level_mult: self.level_mult,
            dimension: self.dimension,
            nodes: BTreeMap::new(),
            entry_point: None,
            level_max: 0,
            next_id: self.next_id,
            rng_state: 42,
        };
        for (id, node) in &self.nodes {
            if !node.deleted {
                rebuilt.insert_with_id(*id, node.vector.clone());
            }
        }
        rebuilt
    }

    fn insert_with_id(&mut self, id: u32, vector: Vec<f32>) {
        let level = self.select_level();
        let node = Node {
            vector,
            neighbors: vec![Vec::new(); level as usize + 1],
            deleted: false,
        };
        let Some(mut ep) = self.entry_point else {
            self.nodes.insert(id, node);
            self.entry_point = Some(id);
            self.level_max = level;
            return;
        };
        let query = node.vector.clone();
        self.nodes.insert(id, node);

        let mut current = self.level_max;
        while current > level {
            ep = self.greedy_closest(ep, &query, current);
            current -= 1;
        }

        for lc in (0..=level.min(self.level_max)).rev() {
            let found: Vec<Candidate> = self
                .search_layer(ep, &query, self.ef_construction, lc)
                .into_iter()
                .filter(|candidate| candidate.id != id)
                .collect();
            let m_limit = if lc == 0 { self.m_max0 } else { self.m };
            let selected: Vec<u32> = found.iter().take(self.m).map(|c| c.id).collect();
            for &neighbor in &selected {
                self.link(id, neighbor, lc);
                self.link(neighbor, id, lc);
                self.prune(neighbor, lc, m_limit);
            }
            if let Some(first) = found.first() {
                ep = first.id;
            }
        }

        if level > self.level_max {
            self.entry_point = Some(id);
            self.level_max = level;
        }
    }

    fn select_level(&mut self) -> u8 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let r = ((self.rng_state >> 11) as f64 / (1u64 << 53) as f64).max(1e-12);
        let level = (-r.ln() * self.level_mult).floor();
        (level as u8).min(MAX_LEVEL)
    }

    fn distance_to(&self, id: u32, query: &[f32]) -> f32 {
        self.nodes
            .get(&id)
            .map(|node| cosine_distance(&node.vector, query))
            .unwrap_or(f32::INFINITY)
    }

    fn neighbors(&self, id: u32, level: u8) -> &[u32] {
        self.nodes
            .get(&id)
            .and_then(|node| node.neighbors.get(level as usize))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn greedy_closest(&self, entry: u32, query: &[f32], level: u8) -> u32 {
        let mut current = entry;
        let mut current_dist = self.distance_to(current, query);
        loop {
            let mut changed = false;
            for &neighbor in self.neighbors(current, level) {
                let dist = self.distance_to(neighbor, query);
                if dist < current_dist {
                    current = neighbor;
                    current_dist = dist;
                    changed = true;
                }
            }
            if !changed {
                return current;
            }
        }
    }

    fn search_layer(&self, entry: u32, query: &[f32], ef: usize, level: u8) -> Vec<Candidate> {
        let mut visited: HashSet<u32> = HashSet::new();
        let mut candidates: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();

        let start = Candidate {
            distance: self.distance_to(entry, query),
            id: entry,
        };
        visited.insert(entry);
        candidates.push(Reverse(start));
        results.push(start);

        while let Some(Reverse(current)) = candidates.pop() {
            let worst = results.peek().map(|c| c.distance).unwrap_or(f32::INFINITY);
            if current.distance > worst && results.len() >= ef {
                break;
            }
            for &neighbor in self.neighbors(current.id, level) {
                if !visited.insert(neighbor) {
                    continue;
                }
                let candidate = Candidate {
                    distance: self.distance_to(neighbor, query),
                    id: neighbor,
                };
                let worst = results.peek().map(|c| c.distance).unwrap_or(f32::INFINITY);
                if results.len() < ef || candidate.distance < worst {
                    candidates.push(Reverse(candidate));
                    results.push(candidate);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }
        results.into_sorted_vec()
    }

    fn link(&mut self, from: u32, to: u32, level: u8) {
        if let Some(node) = self.nodes.get_mut(&from) {
            while node.neighbors.len() <= level as usize {
                node.neighbors.push(Vec::new());
            }
            let list = &mut node.neighbors[level as usize];
            if !list.contains(&to) {
                list.push(to);
            }
        }
    }

    fn prune(&mut self, id: u32, level: u8, max_neighbors: usize) {
        let (vector, current) = match self.nodes.get(&id) {
            Some(node) => match node.neighbors.get(level as usize) {
                Some(list) if list.len() > max_neighbors => (node.vector.clone(), list.clone()),
                _ => return,
            },
            None => return,
        };
        let mut scored: Vec<Candidate> = current
            .into_iter()
            .map(|neighbor| Candidate {
                distance: self.distance_to(neighbor, &vector),
                id: neighbor,
            })
            .collect();
        scored.sort();
        scored.truncate(max_neighbors);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.neighbors[level as usize] = scored.into_iter().map(|c| c.id).collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AnnParams {
        AnnParams {
            m: 8,
            ef_construction: 32,
            ef_search: 32,
        }
    }

    fn unit(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        v
    }

    fn pseudo_random_vectors(count: usize, dim: usize) -> Vec<Vec<f32>> {
        let mut state = 9u64;
        (0..count)
            .map(|_| {
                (0..dim)
                    .map(|_| {
                        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                        ((state >> 33) as f32 / u32::MAX as f32) - 0.5
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn ids_follow_insertion_order() {
        let mut graph = HnswGraph::new(3, params());
        assert_eq!(graph.insert(unit(3, 0)).unwrap(), 0);
        assert_eq!(graph.insert(unit(3, 1)).unwrap(), 1);
        assert_eq!(graph.insert(unit(3, 2)).unwrap(), 2);
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn rejects_wrong_dimension() {
        let mut graph = HnswGraph::new(3, params());
        let err = graph.insert(vec![1.0, 0.0]).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn zero_k_returns_nothing() {
        let mut graph = HnswGraph::new(2, params());
        graph.insert(vec![1.0, 0.0]).unwrap();
        assert!(graph.search(&[1.0, 0.0], 0, 16).is_empty());
        assert!(graph.exact(&[1.0, 0.0], 0, |_| true).is_empty());
    }

    #[test]
    fn search_finds_exact_match_first() {
        let vectors = pseudo_random_vectors(300, 16);
        let mut graph = HnswGraph::new(16, params());
        for v in &vectors {
            graph.insert(v.clone()).unwrap();
        }
        for target in [0usize, 57, 123, 299] {
            let hits = graph.search(&vectors[target], 5, 64);
            assert_eq!(hits[0].id, target as u32);
            assert!(hits[0].distance < 1e-5);
            for pair in hits.windows(2) {
                assert!(pair[0].distance <= pair[1].distance);
            }
        }
    }

    #[test]
    fn approximate_matches_exact_top_hit() {
        let vectors = pseudo_random_vectors(200, 8);
        let mut graph = HnswGraph::new(8, params());
        for v in &vectors {
            graph.insert(v.clone()).unwrap();
        }
        let query = vec![0.1, 0.5, -0.2, 0.3, 0.0, 0.9, -0.4, 0.2];
        let exact = graph.exact(&query, 1, |_| true);
        let approx = graph.search(&query, 1, 128);
        assert_eq!(exact[0].id, approx[0].id);
    }

    #[test]
    fn ties_break_on_insertion_order() {
        let mut graph = HnswGraph::new(2, params());
        graph.insert(vec![1.0, 0.0]).unwrap();
        graph.insert(vec![2.0, 0.0]).unwrap();
        graph.insert(vec![3.0, 0.0]).unwrap();
        let hits = graph.exact(&[1.0, 0.0], 3, |_| true);
        let ids: Vec<u32> = hits.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn deleted_nodes_are_hidden_and_compacted_away() {
        let mut graph = HnswGraph::new(2, params());
        graph.insert(vec![1.0, 0.0]).unwrap();
        graph.insert(vec![0.0, 1.0]).unwrap();
        assert!(graph.mark_deleted(0));
        assert!(!graph.mark_deleted(0));
        let hits = graph.search(&[1.0, 0.0], 2, 16);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 1);
        assert_eq!(graph.tombstones(), 1);

        let compacted = graph.compacted();
        assert_eq!(compacted.len(), 1);
        assert_eq!(compacted.tombstones(), 0);
        assert!(compacted.contains(1));
        let mut compacted = compacted;
        assert_eq!(compacted.insert(vec![1.0, 1.0]).unwrap(), 2);
    }

    #[test]
    fn serde_roundtrip_preserves_search() {
        let vectors = pseudo_random_vectors(50, 4);
        let mut graph = HnswGraph::new(4, params());
        for v in &vectors {
            graph.insert(v.clone()).unwrap();
        }
        let bytes = bincode::serialize(&graph).unwrap();
        let restored: HnswGraph = bincode::deserialize(&bytes).unwrap();
        let before: Vec<u32> = graph.search(&vectors[7], 3, 32).iter().map(|c| c.id).collect();
        let after: Vec<u32> = restored.search(&vectors[7], 3, 32).iter().map(|c| c.id).collect();
        assert_eq!(before, after);
    }
}
