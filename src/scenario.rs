//! Scenario overlays: project edges reclassified to low stress
//!
//! `projects.csv`: `project_id,edge_id`, one row per edge of a proposed
//! project. A scenario run admits the project's edges into the threshold
//! network; in subtract form it admits the edges of every *other* project.
//! Neither form touches the graph itself: the result is an [`EdgeMask`]
//! handed to [`GraphView::with_overrides`](crate::network::GraphView::with_overrides).

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::blocks::{BlockId, BlockSet};
use crate::core::error::{Error, Result};
use crate::network::{EdgeId, EdgeMask, Graph};
use crate::store::ScenarioTag;

#[derive(Debug, Deserialize)]
struct ProjectRecord {
    project_id: i64,
    edge_id: EdgeId,
}

/// Project id → edge ids
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProjectEdges {
    projects: BTreeMap<i64, BTreeSet<EdgeId>>,
}

impl ProjectEdges {
    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)?;
        let mut projects = Self::default();
        for row in reader.deserialize() {
            let record: ProjectRecord = row?;
            projects.insert(record.project_id, record.edge_id);
        }
        tracing::info!(
            projects = projects.projects.len(),
            path = %path.display(),
            "loaded project edges"
        );
        Ok(projects)
    }

    pub fn insert(&mut self, project_id: i64, edge_id: EdgeId) {
        self.projects.entry(project_id).or_default().insert(edge_id);
    }

    pub fn contains(&self, project_id: i64) -> bool {
        self.projects.contains_key(&project_id)
    }

    pub fn project_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.projects.keys().copied()
    }

    pub fn edges(&self, project_id: i64) -> Option<&BTreeSet<EdgeId>> {
        self.projects.get(&project_id)
    }
}

impl FromIterator<(i64, EdgeId)> for ProjectEdges {
    fn from_iter<T: IntoIterator<Item = (i64, EdgeId)>>(iter: T) -> Self {
        let mut projects = Self::default();
        for (project, edge) in iter {
            projects.insert(project, edge);
        }
        projects
    }
}

/// Which overlay a scenario run applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScenarioRequest {
    pub project_id: i64,
    /// Apply every project except `project_id`
    pub subtract: bool,
}

impl ScenarioRequest {
    pub fn tag(&self) -> ScenarioTag {
        ScenarioTag {
            scenario_id: self.project_id,
            subtract: self.subtract,
        }
    }

    /// Edge ids admitted as low stress by this scenario
    pub fn edge_ids(&self, projects: &ProjectEdges) -> Result<BTreeSet<EdgeId>> {
        let Some(own) = projects.edges(self.project_id) else {
            return Err(Error::Config(format!(
                "project {} has no edges in the project table",
                self.project_id
            )));
        };
        if !self.subtract {
            return Ok(own.clone());
        }

        let others: Vec<i64> = projects
            .project_ids()
            .filter(|&p| p != self.project_id)
            .collect();
        if others.is_empty() {
            return Err(Error::Config(format!(
                "subtract scenario for project {} needs at least one other project",
                self.project_id
            )));
        }
        Ok(others
            .into_iter()
            .filter_map(|p| projects.edges(p))
            .flatten()
            .copied()
            .collect())
    }

    /// Resolve to an override mask over `graph`
    pub fn resolve(&self, projects: &ProjectEdges, graph: &Graph) -> Result<EdgeMask> {
        let ids = self.edge_ids(projects)?;
        let mask = EdgeMask::from_edge_ids(graph, &ids)?;
        tracing::debug!(
            project = self.project_id,
            subtract = self.subtract,
            edges = mask.count(),
            "resolved scenario overrides"
        );
        Ok(mask)
    }
}

/// Blocks whose envelope lies within `max_distance` of an endpoint of any
/// edge in `mask`, ascending ids
pub fn affected_blocks(
    mask: &EdgeMask,
    graph: &Graph,
    blocks: &BlockSet,
    max_distance: f64,
) -> Vec<BlockId> {
    let mut endpoints = BTreeSet::new();
    for edge in mask.iter() {
        endpoints.insert(graph.tail(edge));
        endpoints.insert(graph.head(edge));
    }

    let mut affected = BTreeSet::new();
    for node in endpoints {
        affected.extend(blocks.within_distance_of_point(graph.position(node), max_distance));
    }
    affected.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::Block;
    use crate::network::{EdgeRecord, NodeRecord};

    fn graph() -> Graph {
        let nodes: Vec<NodeRecord> = (1..=4)
            .map(|id| NodeRecord {
                node_id: id,
                x: (id as f64 - 1.0) * 1000.0,
                y: 0.0,
                road_id: None,
            })
            .collect();
        let edges: Vec<EdgeRecord> = (1..=3)
            .map(|id| EdgeRecord {
                edge_id: id * 10,
                from_node: id,
                to_node: id + 1,
                cost: Some(1000.0),
                stress: 4,
            })
            .collect();
        Graph::build(&nodes, &edges).unwrap()
    }

    fn projects() -> ProjectEdges {
        [(1, 10), (2, 20), (3, 30), (3, 20)].into_iter().collect()
    }

    #[test]
    fn test_plain_and_subtract_resolution() {
        let g = graph();
        let projects = projects();

        let plain = ScenarioRequest { project_id: 1, subtract: false };
        assert_eq!(plain.edge_ids(&projects).unwrap(), BTreeSet::from([10]));
        assert_eq!(plain.resolve(&projects, &g).unwrap().count(), 1);

        let subtract = ScenarioRequest { project_id: 1, subtract: true };
        assert_eq!(subtract.edge_ids(&projects).unwrap(), BTreeSet::from([20, 30]));
        assert_eq!(subtract.tag(), ScenarioTag { scenario_id: 1, subtract: true });
    }

    #[test]
    fn test_unknown_project_and_lonely_subtract_fail() {
        let projects: ProjectEdges = [(5, 10)].into_iter().collect();
        let missing = ScenarioRequest { project_id: 6, subtract: false };
        assert!(matches!(missing.edge_ids(&projects), Err(Error::Config(_))));

        let lonely = ScenarioRequest { project_id: 5, subtract: true };
        assert!(matches!(lonely.edge_ids(&projects), Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_edge_is_integrity_error() {
        let projects: ProjectEdges = [(1, 999)].into_iter().collect();
        let request = ScenarioRequest { project_id: 1, subtract: false };
        assert!(matches!(
            request.resolve(&projects, &graph()),
            Err(Error::DataIntegrity(_))
        ));
    }

    #[test]
    fn test_affected_blocks_near_override_endpoints() {
        let g = graph();
        let blocks = BlockSet::new(vec![
            Block::point(1, 0.0, 100.0),
            Block::point(2, 1000.0, 100.0),
            Block::point(3, 2500.0, 0.0),
            Block::point(4, 3000.0, 100.0),
        ])
        .unwrap();

        // Edge 10 spans x = 0..1000
        let mask = EdgeMask::from_edge_ids(&g, &[10]).unwrap();
        assert_eq!(affected_blocks(&mask, &g, &blocks, 500.0), vec![1, 2]);
        assert_eq!(affected_blocks(&mask, &g, &blocks, 1600.0), vec![1, 2, 3]);
        assert!(affected_blocks(&EdgeMask::new(g.n_edges()), &g, &blocks, 500.0).is_empty());
    }
}
