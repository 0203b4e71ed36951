//! Directed street network with per-edge cost and stress
//!
//! The network-build step hands us two tables: nodes `(node_id, x, y)` and
//! directed edges `(edge_id, from_node, to_node, cost, stress)`. They are
//! assembled into a compact CSR graph:
//!
//! - node ids are remapped to dense `u32` indices (sorted by id, so the
//!   layout is deterministic),
//! - out-edges of node `u` occupy `offsets[u]..offsets[u + 1]`,
//! - cost, stress, tail and original id live in parallel arrays indexed by
//!   the CSR edge position.
//!
//! Integrity problems are reported, never repaired: a dropped edge would
//! silently bias every connectivity result that routes through it.

pub mod search;
pub mod tables;
pub mod view;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::core::error::{Error, Result};

pub use search::{SearchError, SearchScratch, SearchStats, VirtualOrigin};
pub use tables::{load_graph, read_edges, read_nodes, EdgeRecord, NodeRecord};
pub use view::{EdgeMask, GraphView};

pub type NodeId = i64;
pub type EdgeId = i64;

/// Level of traffic stress on one directed edge. Lower is calmer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StressLevel {
    Rated(u8),
    Impassable,
}

impl StressLevel {
    /// Table value marking an edge nobody can ride
    pub const IMPASSABLE_SENTINEL: i64 = 99;
    /// Highest rating accepted from the classifier
    pub const MAX_RATED: u8 = 10;

    pub fn from_raw(raw: i64) -> Option<Self> {
        if raw == Self::IMPASSABLE_SENTINEL {
            return Some(StressLevel::Impassable);
        }
        if (1..=Self::MAX_RATED as i64).contains(&raw) {
            return Some(StressLevel::Rated(raw as u8));
        }
        None
    }

    pub fn is_passable(self) -> bool {
        matches!(self, StressLevel::Rated(_))
    }

    /// True when the edge belongs to the network of stress ≤ `max_stress`
    pub fn within(self, max_stress: u8) -> bool {
        match self {
            StressLevel::Rated(level) => level <= max_stress,
            StressLevel::Impassable => false,
        }
    }
}

/// Immutable directed graph in CSR layout
#[derive(Debug, Clone)]
pub struct Graph {
    node_ids: Vec<NodeId>,
    positions: Vec<[f64; 2]>,
    road_ids: Vec<Option<i64>>,
    node_index: FxHashMap<NodeId, u32>,

    offsets: Vec<u32>, // n_nodes + 1
    heads: Vec<u32>,   // n_edges
    tails: Vec<u32>,   // n_edges
    costs: Vec<f64>,   // n_edges
    stress: Vec<StressLevel>,
    edge_ids: Vec<EdgeId>,
    edge_index: FxHashMap<EdgeId, u32>,
}

impl Graph {
    /// Build the graph, failing with `DataIntegrity` on the first bad row
    pub fn build(nodes: &[NodeRecord], edges: &[EdgeRecord]) -> Result<Self> {
        let mut sorted_nodes: Vec<&NodeRecord> = nodes.iter().collect();
        sorted_nodes.sort_unstable_by_key(|n| n.node_id);

        let mut node_ids = Vec::with_capacity(nodes.len());
        let mut positions = Vec::with_capacity(nodes.len());
        let mut road_ids = Vec::with_capacity(nodes.len());
        let mut node_index = FxHashMap::default();
        node_index.reserve(nodes.len());

        for node in sorted_nodes {
            if !node.x.is_finite() || !node.y.is_finite() {
                return Err(Error::DataIntegrity(format!(
                    "node {} has a non-finite position ({}, {})",
                    node.node_id, node.x, node.y
                )));
            }
            let idx = u32::try_from(node_ids.len()).map_err(|_| {
                Error::DataIntegrity("node table exceeds u32 index space".to_string())
            })?;
            if node_index.insert(node.node_id, idx).is_some() {
                return Err(Error::DataIntegrity(format!(
                    "duplicate node id {}",
                    node.node_id
                )));
            }
            node_ids.push(node.node_id);
            positions.push([node.x, node.y]);
            road_ids.push(node.road_id);
        }

        // Validate every edge before laying out the CSR
        let mut resolved: Vec<(u32, u32, f64, StressLevel, EdgeId)> =
            Vec::with_capacity(edges.len());
        let mut seen_edges: FxHashMap<EdgeId, ()> = FxHashMap::default();
        seen_edges.reserve(edges.len());

        for edge in edges {
            if seen_edges.insert(edge.edge_id, ()).is_some() {
                return Err(Error::DataIntegrity(format!(
                    "duplicate edge id {}",
                    edge.edge_id
                )));
            }
            let from = *node_index.get(&edge.from_node).ok_or_else(|| {
                Error::DataIntegrity(format!(
                    "edge {} references missing node {}",
                    edge.edge_id, edge.from_node
                ))
            })?;
            let to = *node_index.get(&edge.to_node).ok_or_else(|| {
                Error::DataIntegrity(format!(
                    "edge {} references missing node {}",
                    edge.edge_id, edge.to_node
                ))
            })?;
            let cost = match edge.cost {
                Some(c) if c.is_finite() && c >= 0.0 => c,
                Some(c) => {
                    return Err(Error::DataIntegrity(format!(
                        "edge {} has invalid cost {}",
                        edge.edge_id, c
                    )))
                }
                None => {
                    return Err(Error::DataIntegrity(format!(
                        "edge {} has no cost",
                        edge.edge_id
                    )))
                }
            };
            let stress = StressLevel::from_raw(edge.stress).ok_or_else(|| {
                Error::DataIntegrity(format!(
                    "edge {} has invalid stress {}",
                    edge.edge_id, edge.stress
                ))
            })?;
            resolved.push((from, to, cost, stress, edge.edge_id));
        }

        // Stable sort keeps input order within a node's out-edges
        resolved.sort_by_key(|&(from, _, _, _, _)| from);

        let n_nodes = node_ids.len();
        let n_edges = resolved.len();
        if u32::try_from(n_edges).is_err() {
            return Err(Error::DataIntegrity(
                "edge table exceeds u32 index space".to_string(),
            ));
        }

        let mut offsets = vec![0u32; n_nodes + 1];
        for &(from, _, _, _, _) in &resolved {
            offsets[from as usize + 1] += 1;
        }
        for i in 0..n_nodes {
            offsets[i + 1] += offsets[i];
        }

        let mut heads = Vec::with_capacity(n_edges);
        let mut tails = Vec::with_capacity(n_edges);
        let mut costs = Vec::with_capacity(n_edges);
        let mut stress = Vec::with_capacity(n_edges);
        let mut edge_ids = Vec::with_capacity(n_edges);
        let mut edge_index = FxHashMap::default();
        edge_index.reserve(n_edges);

        for (pos, (from, to, cost, level, id)) in resolved.into_iter().enumerate() {
            heads.push(to);
            tails.push(from);
            costs.push(cost);
            stress.push(level);
            edge_ids.push(id);
            edge_index.insert(id, pos as u32);
        }

        tracing::debug!(nodes = n_nodes, edges = n_edges, "built network graph");

        Ok(Self {
            node_ids,
            positions,
            road_ids,
            node_index,
            offsets,
            heads,
            tails,
            costs,
            stress,
            edge_ids,
            edge_index,
        })
    }

    pub fn n_nodes(&self) -> usize {
        self.node_ids.len()
    }

    pub fn n_edges(&self) -> usize {
        self.heads.len()
    }

    pub fn node_id(&self, idx: u32) -> NodeId {
        self.node_ids[idx as usize]
    }

    pub fn node_index(&self, id: NodeId) -> Option<u32> {
        self.node_index.get(&id).copied()
    }

    pub fn position(&self, idx: u32) -> [f64; 2] {
        self.positions[idx as usize]
    }

    pub fn positions(&self) -> &[[f64; 2]] {
        &self.positions
    }

    /// Road or intersection feature the node was derived from, if known
    pub fn road_id(&self, idx: u32) -> Option<i64> {
        self.road_ids[idx as usize]
    }

    /// CSR positions of the out-edges of `idx`
    pub fn out_edges(&self, idx: u32) -> Range<usize> {
        self.offsets[idx as usize] as usize..self.offsets[idx as usize + 1] as usize
    }

    pub fn head(&self, edge: usize) -> u32 {
        self.heads[edge]
    }

    pub fn tail(&self, edge: usize) -> u32 {
        self.tails[edge]
    }

    pub fn cost(&self, edge: usize) -> f64 {
        self.costs[edge]
    }

    pub fn stress(&self, edge: usize) -> StressLevel {
        self.stress[edge]
    }

    pub fn edge_id(&self, edge: usize) -> EdgeId {
        self.edge_ids[edge]
    }

    pub fn edge_index(&self, id: EdgeId) -> Option<usize> {
        self.edge_index.get(&id).map(|&e| e as usize)
    }

    /// Straight-line length of an edge between its endpoint positions
    pub fn edge_length(&self, edge: usize) -> f64 {
        let a = self.positions[self.tails[edge] as usize];
        let b = self.positions[self.heads[edge] as usize];
        ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
    }
}
