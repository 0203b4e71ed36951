//! Shared fixtures: small hand-built networks with blocks sitting on nodes

#![allow(dead_code)]

use butterfly_connect::network::{EdgeRecord, NodeRecord};
use butterfly_connect::{
    Block, BlockSet, ConnectivityConfig, Graph, ProjectEdges, RunContext, RunInputs,
};

pub fn node(id: i64, x: f64, y: f64) -> NodeRecord {
    NodeRecord {
        node_id: id,
        x,
        y,
        road_id: None,
    }
}

/// Both directions of a street segment; ids `edge_id` and `edge_id + 1`
pub fn two_way(edge_id: i64, a: i64, b: i64, cost: f64, stress: i64) -> [EdgeRecord; 2] {
    [
        EdgeRecord {
            edge_id,
            from_node: a,
            to_node: b,
            cost: Some(cost),
            stress,
        },
        EdgeRecord {
            edge_id: edge_id + 1,
            from_node: b,
            to_node: a,
            cost: Some(cost),
            stress,
        },
    ]
}

/// Config with tight snapping and no artifact filtering
pub fn config(max_distance: f64, max_detour_pct: f64, max_stress: u8) -> ConnectivityConfig {
    ConnectivityConfig {
        max_distance,
        max_detour_pct,
        max_stress,
        tolerance: 1.0,
        min_segment_length: 0.0,
        workers: 2,
        retry_backoff_ms: 1,
        max_backoff_ms: 4,
        ..ConnectivityConfig::default()
    }
}

pub fn context(config: ConnectivityConfig) -> RunContext {
    RunContext::new(config).with_progress(false)
}

/// One block per node, id `node_id * 10`, at the node's position
pub fn blocks_on(nodes: &[NodeRecord]) -> BlockSet {
    BlockSet::new(
        nodes
            .iter()
            .map(|n| Block::point(n.node_id * 10, n.x, n.y))
            .collect(),
    )
    .unwrap()
}

pub fn inputs(
    nodes: &[NodeRecord],
    edges: &[EdgeRecord],
    blocks: BlockSet,
    projects: ProjectEdges,
    config: &ConnectivityConfig,
) -> RunInputs {
    let graph = Graph::build(nodes, edges).unwrap();
    RunInputs::prepare(graph, blocks, projects, config)
}

/// A straight street of `n` nodes, 100 apart, all at `stress`
pub fn street(n: i64, stress: i64) -> (Vec<NodeRecord>, Vec<EdgeRecord>) {
    let nodes: Vec<NodeRecord> = (1..=n).map(|id| node(id, id as f64 * 100.0, 0.0)).collect();
    let edges = (1..n)
        .flat_map(|id| two_way(id * 100, id, id + 1, 100.0, stress))
        .collect();
    (nodes, edges)
}

/// Blocks 10 and 20 joined directly by a stress-3 edge of cost 10 and by a
/// stress-1 dogleg through node 3 whose legs cost `leg` each
pub fn dogleg(leg: f64) -> (Vec<NodeRecord>, Vec<EdgeRecord>) {
    let nodes = vec![node(1, 0.0, 0.0), node(2, 10.0, 0.0), node(3, 5.0, 5.0)];
    let mut edges = Vec::new();
    edges.extend(two_way(100, 1, 2, 10.0, 3));
    edges.extend(two_way(200, 1, 3, leg, 1));
    edges.extend(two_way(300, 3, 2, leg, 1));
    (nodes, edges)
}

/// Blocks 10 and 20 only (node 3 carries no block)
pub fn dogleg_blocks() -> BlockSet {
    BlockSet::new(vec![Block::point(10, 0.0, 0.0), Block::point(20, 10.0, 0.0)]).unwrap()
}
