//! Filtered views over a [`Graph`]
//!
//! A view is a borrowed predicate over the graph's edge arrays; it never
//! copies edges. The full (high-stress) view admits every passable edge,
//! the threshold view only those with `stress ≤ max_stress`. Scenario
//! overrides add edges to the threshold view regardless of their rating,
//! but never resurrect an impassable edge, so the threshold view is always
//! a subset of the full view.

use super::{EdgeId, Graph};
use crate::core::error::{Error, Result};

/// One bit per CSR edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeMask {
    bits: Vec<u64>,
    n_edges: usize,
}

impl EdgeMask {
    pub fn new(n_edges: usize) -> Self {
        Self {
            bits: vec![0u64; n_edges.div_ceil(64)],
            n_edges,
        }
    }

    /// Mask of the given external edge ids; unknown ids are integrity errors
    pub fn from_edge_ids<'a, I>(graph: &Graph, ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a EdgeId>,
    {
        let mut mask = Self::new(graph.n_edges());
        for &id in ids {
            let edge = graph.edge_index(id).ok_or_else(|| {
                Error::DataIntegrity(format!("edge {id} is not part of the network"))
            })?;
            mask.insert(edge);
        }
        Ok(mask)
    }

    pub fn insert(&mut self, edge: usize) {
        debug_assert!(edge < self.n_edges);
        self.bits[edge / 64] |= 1u64 << (edge % 64);
    }

    pub fn contains(&self, edge: usize) -> bool {
        let word = edge / 64;
        word < self.bits.len() && (self.bits[word] & (1u64 << (edge % 64))) != 0
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.n_edges).filter(move |&e| self.contains(e))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GraphView<'g> {
    graph: &'g Graph,
    max_stress: Option<u8>,
    overrides: Option<&'g EdgeMask>,
}

impl<'g> GraphView<'g> {
    /// The high-stress network: everything passable
    pub fn full(graph: &'g Graph) -> Self {
        Self {
            graph,
            max_stress: None,
            overrides: None,
        }
    }

    /// The threshold subnetwork: passable edges with `stress ≤ max_stress`
    pub fn restrict(graph: &'g Graph, max_stress: u8) -> Self {
        Self {
            graph,
            max_stress: Some(max_stress),
            overrides: None,
        }
    }

    /// Admit `mask` edges as low-stress on top of the threshold
    pub fn with_overrides(mut self, mask: &'g EdgeMask) -> Self {
        self.overrides = Some(mask);
        self
    }

    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    pub fn max_stress(&self) -> Option<u8> {
        self.max_stress
    }

    #[inline]
    pub fn allows(&self, edge: usize) -> bool {
        let stress = self.graph.stress(edge);
        if !stress.is_passable() {
            return false;
        }
        match self.max_stress {
            None => true,
            Some(max) => {
                stress.within(max) || self.overrides.is_some_and(|mask| mask.contains(edge))
            }
        }
    }

    /// Admitted out-edges of `node` as `(head, cost)`
    #[inline]
    pub fn neighbors(&self, node: u32) -> impl Iterator<Item = (u32, f64)> + '_ {
        self.graph
            .out_edges(node)
            .filter(move |&e| self.allows(e))
            .map(move |e| (self.graph.head(e), self.graph.cost(e)))
    }

    /// Number of admitted edges (linear scan)
    pub fn edge_count(&self) -> usize {
        (0..self.graph.n_edges()).filter(|&e| self.allows(e)).count()
    }
}
