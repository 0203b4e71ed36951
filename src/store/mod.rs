//! Connectivity store: the persisted pair relation
//!
//! Rows are keyed by `(source, target, scenario)` where `scenario` is `None`
//! for the base run. Each origin's rows arrive as one [`OriginBatch`] and are
//! committed atomically. Two partial indexes, over low-stress and over
//! high-stress connected rows, serve downstream queries; they are dropped
//! before bulk writes and rebuilt once afterwards, and queries that need them
//! fail while they are stale.

pub mod file;
pub mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::blocks::BlockId;
use crate::core::ConnectivityConfig;
use crate::evaluate::Connectivity;

pub use file::{FileStore, VerifyReport};
pub use memory::MemoryStore;

/// Store format version written into the manifest and binary headers
pub const FORMAT_VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store does not exist: {0}")]
    Missing(PathBuf),

    #[error("store already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("corrupt store file {path} at byte {offset}: {reason}")]
    Corrupt {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("invalid connectivity code {0}")]
    InvalidCode(u8),

    #[error("origin {origin} already committed for {scenario}")]
    DuplicateOrigin { origin: BlockId, scenario: String },

    #[error("indexes are missing or stale; run `index` first")]
    IndexUnavailable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Scenario key of a row; absent for the base run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScenarioTag {
    pub scenario_id: i64,
    pub subtract: bool,
}

impl fmt::Display for ScenarioTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.subtract {
            write!(f, "scenario -{}", self.scenario_id)
        } else {
            write!(f, "scenario {}", self.scenario_id)
        }
    }
}

pub(crate) fn scenario_label(scenario: Option<ScenarioTag>) -> String {
    match scenario {
        Some(tag) => tag.to_string(),
        None => "base".to_string(),
    }
}

/// One persisted row
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairRecord {
    pub scenario: Option<ScenarioTag>,
    pub source: BlockId,
    pub target: BlockId,
    pub connectivity: Connectivity,
}

impl PairRecord {
    pub fn high_stress_connected(&self) -> bool {
        self.connectivity.high_stress()
    }

    pub fn low_stress_connected(&self) -> bool {
        self.connectivity.low_stress()
    }
}

/// Every row produced for one origin in one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginBatch {
    pub origin: BlockId,
    pub scenario: Option<ScenarioTag>,
    pub pairs: Vec<(BlockId, Connectivity)>,
}

impl OriginBatch {
    pub fn records(&self) -> impl Iterator<Item = PairRecord> + '_ {
        self.pairs.iter().map(|&(target, connectivity)| PairRecord {
            scenario: self.scenario,
            source: self.origin,
            target,
            connectivity,
        })
    }
}

/// Which rows a delete or existence check addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioSelector {
    Base,
    Scenario(ScenarioTag),
    AllScenarios,
}

impl ScenarioSelector {
    pub fn matches(&self, scenario: Option<ScenarioTag>) -> bool {
        match (self, scenario) {
            (ScenarioSelector::Base, None) => true,
            (ScenarioSelector::Scenario(want), Some(have)) => *want == have,
            (ScenarioSelector::AllScenarios, Some(_)) => true,
            _ => false,
        }
    }
}

/// Which partial index a query reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StressFilter {
    LowStress,
    HighStress,
}

impl StressFilter {
    pub fn admits(self, connectivity: Connectivity) -> bool {
        match self {
            StressFilter::LowStress => connectivity.low_stress(),
            StressFilter::HighStress => connectivity.high_stress(),
        }
    }
}

/// Parameters a store was built with; later runs must agree with them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreManifest {
    pub format_version: u16,
    pub created_at: DateTime<Utc>,
    pub max_distance: f64,
    pub max_detour_pct: f64,
    pub max_stress: u8,
    pub tolerance: f64,
    pub min_segment_length: f64,
}

impl StoreManifest {
    pub fn from_config(config: &ConnectivityConfig) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            created_at: Utc::now(),
            max_distance: config.max_distance,
            max_detour_pct: config.max_detour_pct,
            max_stress: config.max_stress,
            tolerance: config.tolerance,
            min_segment_length: config.min_segment_length,
        }
    }

    /// Names of evaluation parameters that differ from `config`
    pub fn conflicts_with(&self, config: &ConnectivityConfig) -> Vec<&'static str> {
        let mut conflicts = Vec::new();
        if self.max_distance != config.max_distance {
            conflicts.push("max_distance");
        }
        if self.max_detour_pct != config.max_detour_pct {
            conflicts.push("max_detour_pct");
        }
        if self.max_stress != config.max_stress {
            conflicts.push("max_stress");
        }
        if self.tolerance != config.tolerance {
            conflicts.push("tolerance");
        }
        if self.min_segment_length != config.min_segment_length {
            conflicts.push("min_segment_length");
        }
        conflicts
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub low_stress_rows: usize,
    pub high_stress_rows: usize,
}

/// Typed operations over the pair relation
pub trait ConnectivityStore {
    fn exists(&self) -> bool;

    /// Create an empty store; an existing one is replaced only with `overwrite`
    fn create(&mut self, overwrite: bool, manifest: StoreManifest) -> Result<(), StoreError>;

    fn manifest(&self) -> Result<StoreManifest, StoreError>;

    fn drop_indexes(&mut self) -> Result<(), StoreError>;

    fn build_indexes(&mut self) -> Result<IndexStats, StoreError>;

    /// True when both indexes reflect every committed row
    fn indexes_valid(&self) -> bool;

    /// Delete the selected rows, returning how many went
    fn delete_rows(&mut self, selector: ScenarioSelector) -> Result<usize, StoreError>;

    /// Persist all rows of one origin, or none of them
    fn commit_origin(&mut self, batch: &OriginBatch) -> Result<usize, StoreError>;

    fn has_rows(&self, selector: ScenarioSelector) -> Result<bool, StoreError>;

    fn lookup(
        &self,
        source: BlockId,
        target: BlockId,
        scenario: Option<ScenarioTag>,
    ) -> Result<Option<Connectivity>, StoreError>;

    /// Targets reachable from `source` at `level`, via the partial index
    fn targets(
        &self,
        source: BlockId,
        level: StressFilter,
        scenario: Option<ScenarioTag>,
    ) -> Result<Vec<BlockId>, StoreError>;

    /// Every row, ordered by `(scenario, source, target)`
    fn rows(&self) -> Result<Vec<PairRecord>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_matching() {
        let tag = ScenarioTag {
            scenario_id: 4,
            subtract: false,
        };
        let other = ScenarioTag {
            scenario_id: 4,
            subtract: true,
        };
        assert!(ScenarioSelector::Base.matches(None));
        assert!(!ScenarioSelector::Base.matches(Some(tag)));
        assert!(ScenarioSelector::Scenario(tag).matches(Some(tag)));
        assert!(!ScenarioSelector::Scenario(tag).matches(Some(other)));
        assert!(ScenarioSelector::AllScenarios.matches(Some(other)));
        assert!(!ScenarioSelector::AllScenarios.matches(None));
    }

    #[test]
    fn test_manifest_conflicts() {
        let config = ConnectivityConfig::default();
        let manifest = StoreManifest::from_config(&config);
        assert!(manifest.conflicts_with(&config).is_empty());

        let stricter = ConnectivityConfig {
            max_stress: 2,
            ..config
        };
        assert_eq!(manifest.conflicts_with(&stricter), vec!["max_stress"]);
    }

    #[test]
    fn test_scenario_labels() {
        assert_eq!(scenario_label(None), "base");
        let tag = ScenarioTag {
            scenario_id: 12,
            subtract: true,
        };
        assert_eq!(scenario_label(Some(tag)), "scenario -12");
    }
}
