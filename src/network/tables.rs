//! CSV tables written by the network-build step
//!
//! `nodes.csv`: `node_id,x,y[,road_id]`
//! `edges.csv`: `edge_id,from_node,to_node,cost,stress`
//!
//! An empty `cost` cell deserializes to `None` so the graph builder can
//! report it as an integrity error instead of a parse failure.

use serde::Deserialize;
use std::path::Path;

use super::{EdgeId, Graph, NodeId};
use crate::core::error::Result;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub road_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EdgeRecord {
    pub edge_id: EdgeId,
    pub from_node: NodeId,
    pub to_node: NodeId,
    pub cost: Option<f64>,
    pub stress: i64,
}

pub fn read_nodes(path: &Path) -> Result<Vec<NodeRecord>> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
    let mut nodes = Vec::new();
    for row in reader.deserialize() {
        nodes.push(row?);
    }
    Ok(nodes)
}

pub fn read_edges(path: &Path) -> Result<Vec<EdgeRecord>> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
    let mut edges = Vec::new();
    for row in reader.deserialize() {
        edges.push(row?);
    }
    Ok(edges)
}

/// Read both tables and build the graph
pub fn load_graph(nodes_path: &Path, edges_path: &Path) -> Result<Graph> {
    let nodes = read_nodes(nodes_path)?;
    let edges = read_edges(edges_path)?;
    tracing::info!(
        nodes = nodes.len(),
        edges = edges.len(),
        "loaded network tables"
    );
    Graph::build(&nodes, &edges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_tables_with_optional_columns() {
        let dir = tempfile::tempdir().unwrap();
        let nodes_path = dir.path().join("nodes.csv");
        let edges_path = dir.path().join("edges.csv");

        let mut nodes = std::fs::File::create(&nodes_path).unwrap();
        writeln!(nodes, "node_id,x,y,road_id").unwrap();
        writeln!(nodes, "1,0.0,0.0,100").unwrap();
        writeln!(nodes, "2,10.0,0.0,").unwrap();

        let mut edges = std::fs::File::create(&edges_path).unwrap();
        writeln!(edges, "edge_id,from_node,to_node,cost,stress").unwrap();
        writeln!(edges, "7, 1, 2, 10.0, 1").unwrap();
        writeln!(edges, "8,2,1,,3").unwrap();

        let node_rows = read_nodes(&nodes_path).unwrap();
        assert_eq!(node_rows[0].road_id, Some(100));
        assert_eq!(node_rows[1].road_id, None);

        let edge_rows = read_edges(&edges_path).unwrap();
        assert_eq!(edge_rows[0].cost, Some(10.0));
        assert_eq!(edge_rows[1].cost, None);

        // The empty cost surfaces as an integrity error, not a silent drop
        assert!(load_graph(&nodes_path, &edges_path).is_err());
    }
}
