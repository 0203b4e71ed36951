//! Per-origin connectivity classification
//!
//! For one origin block the evaluator runs at most two bounded searches, both
//! from the same virtual origin:
//!
//! 1. on the full network, bounded by `max_distance`, giving `D_hs` for
//!    every candidate destination at once;
//! 2. only if some destination was reached, on the threshold network,
//!    bounded by `min(max_distance, max D_hs × max_detour)`, giving `D_ls`.
//!
//! A pair is low-stress connected iff `D_ls ≤ D_hs × max_detour`. Because
//! the low-stress search never runs for a pair the full search missed, a
//! "low but not high" result cannot be produced, and [`Connectivity`] cannot
//! even represent it.

use serde::{Deserialize, Serialize};

use crate::blocks::{AttachmentIndex, BlockId};
use crate::core::ConnectivityConfig;
use crate::network::{GraphView, SearchError, SearchScratch, SearchStats};

/// Absorbs float noise when comparing summed path costs
const DETOUR_EPSILON: f64 = 1e-9;

/// Classification of one origin/destination pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Connectivity {
    Disconnected,
    HighStressOnly,
    BothConnected,
}

impl Connectivity {
    /// Wire code: bit 0 = high stress, bit 1 = low stress
    pub fn code(self) -> u8 {
        match self {
            Connectivity::Disconnected => 0,
            Connectivity::HighStressOnly => 1,
            Connectivity::BothConnected => 3,
        }
    }

    /// Decode a wire code; `2` (low without high) is not a valid state
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Connectivity::Disconnected),
            1 => Some(Connectivity::HighStressOnly),
            3 => Some(Connectivity::BothConnected),
            _ => None,
        }
    }

    pub fn high_stress(self) -> bool {
        self != Connectivity::Disconnected
    }

    pub fn low_stress(self) -> bool {
        self == Connectivity::BothConnected
    }

    /// Apply the distance and detour rules to a pair of search distances
    pub fn classify(d_hs: Option<f64>, d_ls: Option<f64>, params: &SearchParams) -> Self {
        let Some(d_hs) = d_hs.filter(|d| *d <= params.max_distance) else {
            return Connectivity::Disconnected;
        };
        match d_ls {
            Some(d_ls)
                if d_ls <= params.max_distance
                    && d_ls <= d_hs * params.max_detour + DETOUR_EPSILON =>
            {
                Connectivity::BothConnected
            }
            _ => Connectivity::HighStressOnly,
        }
    }
}

/// Search bounds shared by every origin of a run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    pub max_distance: f64,
    /// Multiplier ≥ 1.0
    pub max_detour: f64,
}

impl SearchParams {
    pub fn from_config(config: &ConnectivityConfig) -> Self {
        Self {
            max_distance: config.max_distance,
            max_detour: config.detour_multiplier(),
        }
    }
}

/// One worker's evaluator: shared read-only views plus private scratch
pub struct Evaluator<'a> {
    full: GraphView<'a>,
    low_stress: GraphView<'a>,
    attachments: &'a AttachmentIndex,
    params: SearchParams,
    scratch: SearchScratch,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        full: GraphView<'a>,
        low_stress: GraphView<'a>,
        attachments: &'a AttachmentIndex,
        params: SearchParams,
        max_frontier: usize,
    ) -> Self {
        let scratch = SearchScratch::new(full.graph().n_nodes(), max_frontier);
        Self {
            full,
            low_stress,
            attachments,
            params,
            scratch,
        }
    }

    pub fn params(&self) -> SearchParams {
        self.params
    }

    pub fn stats(&self) -> SearchStats {
        self.scratch.stats()
    }

    /// Classify `origin` against each destination, in the given order
    pub fn evaluate(
        &mut self,
        origin: BlockId,
        destinations: &[BlockId],
    ) -> Result<Vec<(BlockId, Connectivity)>, SearchError> {
        let attachments = self.attachments;
        let origin_nodes = attachments.nodes(origin);
        let mut results = Vec::with_capacity(destinations.len());
        let mut pending: Vec<(usize, &[u32])> = Vec::new();

        for &target in destinations {
            if target == origin {
                results.push((target, Connectivity::BothConnected));
                continue;
            }
            let target_nodes = attachments.nodes(target);
            if !origin_nodes.is_empty() && !target_nodes.is_empty() {
                pending.push((results.len(), target_nodes));
            }
            results.push((target, Connectivity::Disconnected));
        }

        if pending.is_empty() {
            return Ok(results);
        }

        let params = self.params;
        let mut search = self.scratch.attach_origin(origin_nodes);

        search.search(&self.full, params.max_distance)?;
        let reached: Vec<(usize, &[u32], f64)> = pending
            .into_iter()
            .filter_map(|(slot, nodes)| {
                search
                    .distance_to(nodes)
                    .filter(|d| *d <= params.max_distance)
                    .map(|d| (slot, nodes, d))
            })
            .collect();

        if reached.is_empty() {
            return Ok(results);
        }

        let farthest = reached.iter().map(|&(_, _, d)| d).fold(0.0, f64::max);
        let bound = params
            .max_distance
            .min(farthest * params.max_detour + DETOUR_EPSILON);
        search.search(&self.low_stress, bound)?;

        for (slot, nodes, d_hs) in reached {
            results[slot].1 = Connectivity::classify(Some(d_hs), search.distance_to(nodes), &params);
        }

        tracing::trace!(
            origin,
            destinations = destinations.len(),
            "evaluated origin"
        );

        Ok(results)
    }
}
