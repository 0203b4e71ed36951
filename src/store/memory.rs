//! In-process store for tests and embedders

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use super::{
    scenario_label, ConnectivityStore, IndexStats, OriginBatch, PairRecord, ScenarioSelector,
    ScenarioTag, StoreError, StoreManifest, StressFilter,
};
use crate::blocks::BlockId;
use crate::evaluate::Connectivity;

type RowKey = (Option<ScenarioTag>, BlockId, BlockId);

#[derive(Debug, Default, Clone)]
struct Indexes {
    low: BTreeSet<RowKey>,
    high: BTreeSet<RowKey>,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    manifest: Option<StoreManifest>,
    rows: BTreeMap<RowKey, Connectivity>,
    indexes: Option<Indexes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn require(&self) -> Result<(), StoreError> {
        match self.manifest {
            Some(_) => Ok(()),
            None => Err(StoreError::Missing(PathBuf::from("<memory>"))),
        }
    }

    fn origin_rows(
        &self,
        scenario: Option<ScenarioTag>,
        origin: BlockId,
    ) -> impl Iterator<Item = (&RowKey, &Connectivity)> {
        self.rows
            .range((scenario, origin, BlockId::MIN)..=(scenario, origin, BlockId::MAX))
    }
}

impl ConnectivityStore for MemoryStore {
    fn exists(&self) -> bool {
        self.manifest.is_some()
    }

    fn create(&mut self, overwrite: bool, manifest: StoreManifest) -> Result<(), StoreError> {
        if self.exists() && !overwrite {
            return Err(StoreError::AlreadyExists(PathBuf::from("<memory>")));
        }
        self.rows.clear();
        self.indexes = None;
        self.manifest = Some(manifest);
        Ok(())
    }

    fn manifest(&self) -> Result<StoreManifest, StoreError> {
        self.manifest
            .clone()
            .ok_or_else(|| StoreError::Missing(PathBuf::from("<memory>")))
    }

    fn drop_indexes(&mut self) -> Result<(), StoreError> {
        self.require()?;
        self.indexes = None;
        Ok(())
    }

    fn build_indexes(&mut self) -> Result<IndexStats, StoreError> {
        self.require()?;
        let mut indexes = Indexes::default();
        for (&key, &connectivity) in &self.rows {
            if connectivity.low_stress() {
                indexes.low.insert(key);
            }
            if connectivity.high_stress() {
                indexes.high.insert(key);
            }
        }
        let stats = IndexStats {
            low_stress_rows: indexes.low.len(),
            high_stress_rows: indexes.high.len(),
        };
        self.indexes = Some(indexes);
        Ok(stats)
    }

    fn indexes_valid(&self) -> bool {
        self.indexes.is_some()
    }

    fn delete_rows(&mut self, selector: ScenarioSelector) -> Result<usize, StoreError> {
        self.require()?;
        let before = self.rows.len();
        self.rows.retain(|&(scenario, _, _), _| !selector.matches(scenario));
        let deleted = before - self.rows.len();
        if deleted > 0 {
            self.indexes = None;
        }
        Ok(deleted)
    }

    fn commit_origin(&mut self, batch: &OriginBatch) -> Result<usize, StoreError> {
        self.require()?;
        if self.origin_rows(batch.scenario, batch.origin).next().is_some() {
            return Err(StoreError::DuplicateOrigin {
                origin: batch.origin,
                scenario: scenario_label(batch.scenario),
            });
        }
        for record in batch.records() {
            self.rows.insert(
                (record.scenario, record.source, record.target),
                record.connectivity,
            );
        }
        self.indexes = None;
        Ok(batch.pairs.len())
    }

    fn has_rows(&self, selector: ScenarioSelector) -> Result<bool, StoreError> {
        self.require()?;
        Ok(self.rows.keys().any(|&(scenario, _, _)| selector.matches(scenario)))
    }

    fn lookup(
        &self,
        source: BlockId,
        target: BlockId,
        scenario: Option<ScenarioTag>,
    ) -> Result<Option<Connectivity>, StoreError> {
        self.require()?;
        Ok(self.rows.get(&(scenario, source, target)).copied())
    }

    fn targets(
        &self,
        source: BlockId,
        level: StressFilter,
        scenario: Option<ScenarioTag>,
    ) -> Result<Vec<BlockId>, StoreError> {
        self.require()?;
        let indexes = self.indexes.as_ref().ok_or(StoreError::IndexUnavailable)?;
        let index = match level {
            StressFilter::LowStress => &indexes.low,
            StressFilter::HighStress => &indexes.high,
        };
        Ok(index
            .range((scenario, source, BlockId::MIN)..=(scenario, source, BlockId::MAX))
            .map(|&(_, _, target)| target)
            .collect())
    }

    fn rows(&self) -> Result<Vec<PairRecord>, StoreError> {
        self.require()?;
        Ok(self
            .rows
            .iter()
            .map(|(&(scenario, source, target), &connectivity)| PairRecord {
                scenario,
                source,
                target,
                connectivity,
            })
            .collect())
    }
}
