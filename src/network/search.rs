//! Bounded one-to-many Dijkstra from a virtual origin
//!
//! Each worker owns a [`SearchScratch`]: a distance array sized for the
//! graph plus one extra slot for the virtual origin, a touched list for
//! O(settled) resets, and the heap. The virtual origin's zero-cost edges live
//! in the scratch, never in the shared graph.
//!
//! [`SearchScratch::attach_origin`] returns a [`VirtualOrigin`] guard. While
//! the guard is alive the virtual node exists; dropping it (normally, on an
//! early `?` return, or while unwinding from a panic) clears the virtual
//! edges and every touched distance so the next origin starts clean.
//!
//! A virtual destination is never materialized: its zero-cost in-edges from
//! the destination's access nodes make its distance the minimum over those
//! nodes, which [`VirtualOrigin::distance_to`] reads straight off the
//! distance array.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use thiserror::Error;

use super::view::GraphView;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SearchError {
    /// Priority queue outgrew its budget; transient, fails only this origin
    #[error("search frontier exceeded {limit} entries")]
    FrontierExhausted { limit: usize },

    #[error("scratch sized for {scratch} nodes used on a graph with {graph} nodes")]
    ScratchMismatch { scratch: usize, graph: usize },
}

/// Query statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SearchStats {
    pub searches: usize,
    pub pq_pushes: usize,
    pub pq_pops: usize,
    pub relaxations: usize,
}

#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    cost: f64,
    node: u32,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.node.cmp(&self.node))
    }
}

/// Per-worker search state, reused across origins
#[derive(Debug)]
pub struct SearchScratch {
    n_nodes: usize,
    dist: Vec<f64>, // n_nodes + 1; the last slot is the virtual origin
    touched: Vec<u32>,
    heap: BinaryHeap<HeapEntry>,
    virtual_edges: Vec<u32>,
    max_frontier: usize,
    stats: SearchStats,
}

impl SearchScratch {
    pub fn new(n_nodes: usize, max_frontier: usize) -> Self {
        Self {
            n_nodes,
            dist: vec![f64::INFINITY; n_nodes + 1],
            touched: Vec::new(),
            heap: BinaryHeap::new(),
            virtual_edges: Vec::new(),
            max_frontier,
            stats: SearchStats::default(),
        }
    }

    fn virtual_slot(&self) -> u32 {
        self.n_nodes as u32
    }

    /// Insert the virtual origin with zero-cost edges into `access_nodes`
    pub fn attach_origin(&mut self, access_nodes: &[u32]) -> VirtualOrigin<'_> {
        self.clear();
        self.virtual_edges.extend_from_slice(access_nodes);
        VirtualOrigin { scratch: self }
    }

    pub fn stats(&self) -> SearchStats {
        self.stats
    }

    /// True when no virtual edge or distance survives from an earlier origin
    pub fn is_clean(&self) -> bool {
        self.virtual_edges.is_empty()
            && self.touched.is_empty()
            && self.heap.is_empty()
            && self.dist.iter().all(|d| d.is_infinite())
    }

    fn reset_distances(&mut self) {
        for &node in &self.touched {
            self.dist[node as usize] = f64::INFINITY;
        }
        self.touched.clear();
        self.heap.clear();
    }

    fn clear(&mut self) {
        self.reset_distances();
        self.virtual_edges.clear();
    }

    #[inline]
    fn relax(&mut self, node: u32, cost: f64) -> Result<(), SearchError> {
        self.stats.relaxations += 1;
        let slot = &mut self.dist[node as usize];
        if cost < *slot {
            if slot.is_infinite() {
                self.touched.push(node);
            }
            *slot = cost;
            self.heap.push(HeapEntry { cost, node });
            self.stats.pq_pushes += 1;
            if self.heap.len() > self.max_frontier {
                return Err(SearchError::FrontierExhausted {
                    limit: self.max_frontier,
                });
            }
        }
        Ok(())
    }
}

/// Guard holding the virtual origin inserted into a worker's scratch
pub struct VirtualOrigin<'s> {
    scratch: &'s mut SearchScratch,
}

impl VirtualOrigin<'_> {
    /// Bounded search over `view` from the virtual origin
    ///
    /// Settles every node with distance ≤ `bound`. Distances from a previous
    /// search with the same guard are discarded first.
    pub fn search(&mut self, view: &GraphView<'_>, bound: f64) -> Result<(), SearchError> {
        let s = &mut *self.scratch;
        let graph = view.graph();
        if graph.n_nodes() != s.n_nodes {
            return Err(SearchError::ScratchMismatch {
                scratch: s.n_nodes,
                graph: graph.n_nodes(),
            });
        }

        s.reset_distances();
        s.stats.searches += 1;

        let origin = s.virtual_slot();
        s.dist[origin as usize] = 0.0;
        s.touched.push(origin);
        s.heap.push(HeapEntry {
            cost: 0.0,
            node: origin,
        });
        s.stats.pq_pushes += 1;

        while let Some(HeapEntry { cost, node }) = s.heap.pop() {
            s.stats.pq_pops += 1;

            // Skip if we already found a shorter path
            if cost > s.dist[node as usize] {
                continue;
            }

            if node == origin {
                for i in 0..s.virtual_edges.len() {
                    let head = s.virtual_edges[i];
                    s.relax(head, cost)?;
                }
                continue;
            }

            for (head, weight) in view.neighbors(node) {
                let next = cost + weight;
                if next <= bound {
                    s.relax(head, next)?;
                }
            }
        }

        Ok(())
    }

    /// Distance to a virtual destination fed by `access_nodes`
    pub fn distance_to(&self, access_nodes: &[u32]) -> Option<f64> {
        access_nodes
            .iter()
            .map(|&n| self.scratch.dist[n as usize])
            .filter(|d| d.is_finite())
            .min_by(|a, b| a.total_cmp(b))
    }
}

impl Drop for VirtualOrigin<'_> {
    fn drop(&mut self) {
        self.scratch.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{EdgeRecord, Graph, NodeRecord};

    /// 1 -> 2 -> 3 -> 4 with costs 1, 2, 3; a stress-4 shortcut 1 -> 4 of cost 2
    fn line() -> Graph {
        let nodes: Vec<NodeRecord> = (1..=4)
            .map(|id| NodeRecord {
                node_id: id,
                x: id as f64,
                y: 0.0,
                road_id: None,
            })
            .collect();
        let edges = vec![
            EdgeRecord { edge_id: 1, from_node: 1, to_node: 2, cost: Some(1.0), stress: 1 },
            EdgeRecord { edge_id: 2, from_node: 2, to_node: 3, cost: Some(2.0), stress: 1 },
            EdgeRecord { edge_id: 3, from_node: 3, to_node: 4, cost: Some(3.0), stress: 1 },
            EdgeRecord { edge_id: 4, from_node: 1, to_node: 4, cost: Some(2.0), stress: 4 },
        ];
        Graph::build(&nodes, &edges).unwrap()
    }

    fn idx(g: &Graph, id: i64) -> u32 {
        g.node_index(id).unwrap()
    }

    #[test]
    fn test_search_respects_view() {
        let g = line();
        let mut scratch = SearchScratch::new(g.n_nodes(), 1000);
        let mut origin = scratch.attach_origin(&[idx(&g, 1)]);

        origin.search(&GraphView::full(&g), 100.0).unwrap();
        assert_eq!(origin.distance_to(&[idx(&g, 4)]), Some(2.0));

        origin.search(&GraphView::restrict(&g, 1), 100.0).unwrap();
        assert_eq!(origin.distance_to(&[idx(&g, 4)]), Some(6.0));
    }

    #[test]
    fn test_bound_is_inclusive() {
        let g = line();
        let mut scratch = SearchScratch::new(g.n_nodes(), 1000);
        let low = GraphView::restrict(&g, 1);
        let mut origin = scratch.attach_origin(&[idx(&g, 1)]);

        origin.search(&low, 3.0).unwrap();
        assert_eq!(origin.distance_to(&[idx(&g, 3)]), Some(3.0));
        assert_eq!(origin.distance_to(&[idx(&g, 4)]), None);

        origin.search(&low, 2.999).unwrap();
        assert_eq!(origin.distance_to(&[idx(&g, 3)]), None);
    }

    #[test]
    fn test_virtual_destination_takes_minimum() {
        let g = line();
        let mut scratch = SearchScratch::new(g.n_nodes(), 1000);
        let mut origin = scratch.attach_origin(&[idx(&g, 1), idx(&g, 2)]);
        origin.search(&GraphView::restrict(&g, 1), 100.0).unwrap();

        // Both origin access nodes start at zero
        assert_eq!(origin.distance_to(&[idx(&g, 2)]), Some(0.0));
        assert_eq!(origin.distance_to(&[idx(&g, 3), idx(&g, 4)]), Some(2.0));
        assert_eq!(origin.distance_to(&[]), None);
    }

    #[test]
    fn test_guard_drop_leaves_scratch_clean() {
        let g = line();
        let mut scratch = SearchScratch::new(g.n_nodes(), 1000);
        {
            let mut origin = scratch.attach_origin(&[idx(&g, 1)]);
            origin.search(&GraphView::full(&g), 100.0).unwrap();
        }
        assert!(scratch.is_clean());
        assert_eq!(scratch.stats().searches, 1);
    }

    #[test]
    fn test_frontier_budget_fails_and_still_cleans_up() {
        let g = line();
        let mut scratch = SearchScratch::new(g.n_nodes(), 1);
        {
            let mut origin = scratch.attach_origin(&[idx(&g, 1), idx(&g, 2), idx(&g, 3)]);
            let err = origin.search(&GraphView::full(&g), 100.0).unwrap_err();
            assert_eq!(err, SearchError::FrontierExhausted { limit: 1 });
        }
        assert!(scratch.is_clean());
    }

    #[test]
    fn test_cleanup_survives_panic() {
        let g = line();
        let mut scratch = SearchScratch::new(g.n_nodes(), 1000);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut origin = scratch.attach_origin(&[idx(&g, 1)]);
            origin.search(&GraphView::full(&g), 100.0).unwrap();
            panic!("simulated failure mid-origin");
        }));
        assert!(result.is_err());
        assert!(scratch.is_clean());
    }

    #[test]
    fn test_scratch_mismatch_detected() {
        let g = line();
        let mut scratch = SearchScratch::new(2, 1000);
        let mut origin = scratch.attach_origin(&[0]);
        assert!(matches!(
            origin.search(&GraphView::full(&g), 1.0),
            Err(SearchError::ScratchMismatch { .. })
        ));
    }
}
