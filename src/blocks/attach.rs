//! Block → access node attachment
//!
//! Every node within `tolerance` of a block (its outline when present, its
//! centroid otherwise) becomes an access point, except the free ends of
//! dangling segments shorter than `min_segment_length`: those are base-map
//! slivers, not places a rider can enter the network.

use rayon::prelude::*;
use rstar::{PointDistance, RTree, RTreeObject, AABB};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::{Block, BlockId, BlockSet};
use crate::network::Graph;

/// Network node for the R-tree
#[derive(Clone, Copy, Debug, PartialEq)]
struct IndexedNode {
    coords: [f64; 2],
    idx: u32,
}

impl RTreeObject for IndexedNode {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.coords)
    }
}

impl PointDistance for IndexedNode {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.coords[0] - point[0];
        let dy = self.coords[1] - point[1];
        dx * dx + dy * dy
    }

    fn contains_point(&self, point: &[f64; 2]) -> bool {
        self.coords == *point
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachStats {
    pub blocks: usize,
    pub attached: usize,
    pub empty: usize,
    pub access_nodes: usize,
    /// Nodes inside tolerance dropped as dangling-segment artifacts
    pub artifacts_skipped: usize,
}

/// Block id → sorted access node indices
#[derive(Debug, Default, Clone)]
pub struct AttachmentIndex {
    nodes: FxHashMap<BlockId, Vec<u32>>,
    stats: AttachStats,
}

impl AttachmentIndex {
    /// Build directly from a mapping (node indices, not ids)
    pub fn from_map<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (BlockId, Vec<u32>)>,
    {
        let mut stats = AttachStats::default();
        let mut nodes = FxHashMap::default();
        for (block, mut list) in entries {
            list.sort_unstable();
            list.dedup();
            stats.blocks += 1;
            if list.is_empty() {
                stats.empty += 1;
            } else {
                stats.attached += 1;
                stats.access_nodes += list.len();
            }
            nodes.insert(block, list);
        }
        Self { nodes, stats }
    }

    /// Access nodes of `block`; empty when unattached or unknown
    pub fn nodes(&self, block: BlockId) -> &[u32] {
        self.nodes.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_attached(&self, block: BlockId) -> bool {
        !self.nodes(block).is_empty()
    }

    pub fn stats(&self) -> AttachStats {
        self.stats
    }
}

/// Nodes that are the free end of a dangling segment shorter than `min_len`
fn artifact_nodes(graph: &Graph, min_len: f64) -> Vec<bool> {
    const NONE: u32 = u32::MAX;
    let n = graph.n_nodes();
    let mut neighbor = vec![NONE; n];
    let mut branching = vec![false; n];
    let mut segment = vec![f64::INFINITY; n];

    let mut note = |node: u32, other: u32, length: f64| {
        let slot = node as usize;
        if neighbor[slot] == NONE {
            neighbor[slot] = other;
            segment[slot] = length;
        } else if neighbor[slot] != other {
            branching[slot] = true;
        }
    };

    for edge in 0..graph.n_edges() {
        let (tail, head) = (graph.tail(edge), graph.head(edge));
        if tail == head {
            continue;
        }
        let length = graph.edge_length(edge);
        note(tail, head, length);
        note(head, tail, length);
    }

    (0..n)
        .map(|i| neighbor[i] != NONE && !branching[i] && segment[i] < min_len)
        .collect()
}

fn attach_block(
    block: &Block,
    tree: &RTree<IndexedNode>,
    artifacts: &[bool],
    tolerance: f64,
) -> (Vec<u32>, usize) {
    let (lower, upper) = block.bounds();
    let center = [(lower[0] + upper[0]) / 2.0, (lower[1] + upper[1]) / 2.0];
    let half_diagonal = ((upper[0] - lower[0]).powi(2) + (upper[1] - lower[1]).powi(2)).sqrt() / 2.0;
    let reach = tolerance + half_diagonal;

    let mut skipped = 0;
    let mut nodes: Vec<u32> = tree
        .locate_within_distance(center, reach * reach)
        .filter(|node| block.distance_to_point(node.coords) <= tolerance)
        .filter(|node| {
            let keep = !artifacts[node.idx as usize];
            if !keep {
                skipped += 1;
            }
            keep
        })
        .map(|node| node.idx)
        .collect();
    nodes.sort_unstable();
    (nodes, skipped)
}

/// Attach every block to the network nodes within `tolerance`
pub fn attach(
    blocks: &BlockSet,
    graph: &Graph,
    tolerance: f64,
    min_segment_length: f64,
) -> AttachmentIndex {
    let points: Vec<IndexedNode> = graph
        .positions()
        .iter()
        .enumerate()
        .map(|(idx, &coords)| IndexedNode {
            coords,
            idx: idx as u32,
        })
        .collect();
    let tree = RTree::bulk_load(points);
    let artifacts = artifact_nodes(graph, min_segment_length);

    let all: Vec<&Block> = blocks.iter().collect();
    let results: Vec<(BlockId, Vec<u32>, usize)> = all
        .par_iter()
        .map(|block| {
            let (nodes, skipped) = attach_block(block, &tree, &artifacts, tolerance);
            (block.id, nodes, skipped)
        })
        .collect();

    let skipped: usize = results.iter().map(|(_, _, s)| s).sum();
    for (block, nodes, _) in &results {
        if nodes.is_empty() {
            tracing::debug!(block, "block has no access node within tolerance");
        }
    }

    let mut index = AttachmentIndex::from_map(results.into_iter().map(|(b, n, _)| (b, n)));
    index.stats.artifacts_skipped = skipped;

    tracing::info!(
        blocks = index.stats.blocks,
        attached = index.stats.attached,
        empty = index.stats.empty,
        access_nodes = index.stats.access_nodes,
        artifacts_skipped = skipped,
        "attached blocks to network"
    );

    index
}
