//! Batch orchestration: plan a run, then execute it against a store
//!
//! A run moves through `Building → Running → Indexing → Done`. Planning does
//! every check that can fail the whole run (store presence, parameter
//! agreement with the store manifest, scenario resolution) before anything is
//! written, and yields the ordered operation log that a dry run reports.

pub mod progress;
pub mod report;
pub mod worker;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Instant;

use crate::blocks::{attach, AttachmentIndex, BlockId, BlockSet};
use crate::core::error::{Error, Result};
use crate::core::{ConnectivityConfig, RunContext};
use crate::evaluate::SearchParams;
use crate::network::{EdgeMask, Graph, GraphView};
use crate::scenario::{affected_blocks, ProjectEdges, ScenarioRequest};
use crate::store::{
    ConnectivityStore, ScenarioSelector, ScenarioTag, StoreError, StoreManifest,
};

pub use report::{FailedOrigin, PairCounts, RunReport};
pub use worker::{Backoff, Destinations, OriginState};

/// What a run does to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Create the store and evaluate every block
    Fresh { overwrite: bool },
    /// Evaluate `origins` against all blocks in an existing store
    Append { origins: Vec<BlockId> },
    /// Replace one scenario's rows; origins default to the affected blocks
    Scenario {
        request: ScenarioRequest,
        origins: Option<Vec<BlockId>>,
    },
}

impl RunMode {
    pub fn name(&self) -> &'static str {
        match self {
            RunMode::Fresh { .. } => "fresh",
            RunMode::Append { .. } => "append",
            RunMode::Scenario { .. } => "scenario",
        }
    }

    pub fn scenario(&self) -> Option<ScenarioTag> {
        match self {
            RunMode::Scenario { request, .. } => Some(request.tag()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Building,
    Running,
    Indexing,
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Building => "building",
            RunPhase::Running => "running",
            RunPhase::Indexing => "indexing",
            RunPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// One step of a run, in execution order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlannedOp {
    CreateStore { overwrite: bool },
    DropIndexes,
    DeleteRows { scenario: ScenarioTag },
    EvaluateOrigin { origin: BlockId, candidates: usize },
    BuildIndexes,
}

/// Validated run, ready to execute
#[derive(Debug)]
pub struct RunPlan {
    pub mode: RunMode,
    pub ops: Vec<PlannedOp>,
    origins: Vec<BlockId>,
    restrict: Option<BTreeSet<BlockId>>,
    overrides: Option<EdgeMask>,
}

impl RunPlan {
    pub fn origins(&self) -> &[BlockId] {
        &self.origins
    }
}

/// Inputs loaded once per run
#[derive(Debug)]
pub struct RunInputs {
    pub graph: Graph,
    pub blocks: BlockSet,
    pub attachments: AttachmentIndex,
    pub projects: ProjectEdges,
}

impl RunInputs {
    /// Attach blocks to the graph with the configured tolerance
    pub fn prepare(
        graph: Graph,
        blocks: BlockSet,
        projects: ProjectEdges,
        config: &ConnectivityConfig,
    ) -> Self {
        let attachments = attach(&blocks, &graph, config.tolerance, config.min_segment_length);
        Self {
            graph,
            blocks,
            attachments,
            projects,
        }
    }
}

pub struct Orchestrator<'a> {
    ctx: &'a RunContext,
    inputs: &'a RunInputs,
}

impl<'a> Orchestrator<'a> {
    pub fn new(ctx: &'a RunContext, inputs: &'a RunInputs) -> Self {
        Self { ctx, inputs }
    }

    fn destinations<'p>(&'p self, restrict: Option<&'p BTreeSet<BlockId>>) -> Destinations<'p> {
        Destinations {
            blocks: &self.inputs.blocks,
            restrict,
            max_distance: self.ctx.config.max_distance,
        }
    }

    fn check_manifest(&self, store: &dyn ConnectivityStore, mode: &RunMode) -> Result<()> {
        let manifest = store.manifest()?;
        let conflicts = manifest.conflicts_with(&self.ctx.config);
        if !conflicts.is_empty() {
            return Err(Error::Config(format!(
                "{} run parameters differ from the store's base run: {}",
                mode.name(),
                conflicts.join(", ")
            )));
        }
        Ok(())
    }

    fn check_origins(&self, origins: &[BlockId]) -> Result<()> {
        if let Some(unknown) = origins.iter().find(|&&o| !self.inputs.blocks.contains(o)) {
            return Err(Error::DataIntegrity(format!(
                "origin {unknown} is not in the block table"
            )));
        }
        Ok(())
    }

    /// Validate `mode` against the store and produce the operation log
    pub fn plan(&self, mode: &RunMode, store: &dyn ConnectivityStore) -> Result<RunPlan> {
        self.ctx.config.validate()?;

        let mut ops = Vec::new();
        let mut restrict = None;
        let mut overrides = None;

        let origins: Vec<BlockId> = match mode {
            RunMode::Fresh { overwrite } => {
                if store.exists() && !overwrite {
                    return Err(Error::StoreConflict(
                        "store already exists; pass overwrite to rebuild it".to_string(),
                    ));
                }
                ops.push(PlannedOp::CreateStore {
                    overwrite: *overwrite,
                });
                ops.push(PlannedOp::DropIndexes);
                self.inputs.blocks.ids()
            }
            RunMode::Append { origins } => {
                if !store.exists() {
                    return Err(Error::StoreConflict(
                        "append needs an existing store".to_string(),
                    ));
                }
                self.check_manifest(store, mode)?;
                self.check_origins(origins)?;
                ops.push(PlannedOp::DropIndexes);
                let unique: BTreeSet<BlockId> = origins.iter().copied().collect();
                unique.into_iter().collect()
            }
            RunMode::Scenario { request, origins } => {
                if !store.exists() {
                    return Err(Error::StoreConflict(
                        "scenario runs need an existing base store".to_string(),
                    ));
                }
                // Scenario max_stress must equal the base run's
                self.check_manifest(store, mode)?;
                if request.subtract && !store.has_rows(ScenarioSelector::Base)? {
                    return Err(Error::Config(format!(
                        "subtract scenario for project {} needs base rows in the store",
                        request.project_id
                    )));
                }

                let mask = request.resolve(&self.inputs.projects, &self.inputs.graph)?;
                let affected: BTreeSet<BlockId> = affected_blocks(
                    &mask,
                    &self.inputs.graph,
                    &self.inputs.blocks,
                    self.ctx.config.max_distance,
                )
                .into_iter()
                .collect();

                let chosen: Vec<BlockId> = match origins {
                    Some(list) => {
                        self.check_origins(list)?;
                        let unique: BTreeSet<BlockId> = list.iter().copied().collect();
                        unique.into_iter().collect()
                    }
                    None => affected.iter().copied().collect(),
                };

                ops.push(PlannedOp::DropIndexes);
                ops.push(PlannedOp::DeleteRows {
                    scenario: request.tag(),
                });
                restrict = Some(affected);
                overrides = Some(mask);
                chosen
            }
        };

        let destinations = self.destinations(restrict.as_ref());
        for &origin in &origins {
            ops.push(PlannedOp::EvaluateOrigin {
                origin,
                candidates: destinations.for_origin(origin).len(),
            });
        }
        ops.push(PlannedOp::BuildIndexes);

        tracing::info!(
            mode = mode.name(),
            origins = origins.len(),
            ops = ops.len(),
            "planned run"
        );

        Ok(RunPlan {
            mode: mode.clone(),
            ops,
            origins,
            restrict,
            overrides,
        })
    }

    fn enter(&self, phase: RunPhase) {
        tracing::info!(%phase, "run phase");
    }

    fn empty_report(&self, mode: &RunMode, started: chrono::DateTime<Utc>) -> RunReport {
        RunReport {
            mode: mode.name().to_string(),
            scenario: mode.scenario(),
            started_at: started,
            elapsed_ms: 0,
            dry_run: self.ctx.dry_run,
            cancelled: false,
            origins_total: 0,
            origins_committed: 0,
            origins_failed: 0,
            origins_skipped: 0,
            failed: Vec::new(),
            pairs: PairCounts::default(),
            rows_deleted: 0,
            index: None,
            attachment: self.inputs.attachments.stats(),
            plan: Vec::new(),
        }
    }

    /// Carry out a plan; fatal store errors abort, origin failures do not
    pub fn execute(&self, plan: RunPlan, store: &mut dyn ConnectivityStore) -> Result<RunReport> {
        let started_at = Utc::now();
        let timer = Instant::now();
        let config = &self.ctx.config;
        let mut report = self.empty_report(&plan.mode, started_at);
        report.origins_total = plan.origins.len();

        self.enter(RunPhase::Building);
        for op in &plan.ops {
            match op {
                PlannedOp::CreateStore { overwrite } => {
                    store
                        .create(*overwrite, StoreManifest::from_config(config))
                        .map_err(|e| match e {
                            StoreError::AlreadyExists(path) => Error::StoreConflict(format!(
                                "store already exists: {}",
                                path.display()
                            )),
                            other => other.into(),
                        })?;
                }
                PlannedOp::DropIndexes => store.drop_indexes()?,
                PlannedOp::DeleteRows { scenario } => {
                    report.rows_deleted = store.delete_rows(ScenarioSelector::Scenario(*scenario))?;
                    tracing::info!(%scenario, rows = report.rows_deleted, "deleted prior scenario rows");
                }
                PlannedOp::EvaluateOrigin { .. } | PlannedOp::BuildIndexes => {}
            }
        }

        self.enter(RunPhase::Running);
        let graph = &self.inputs.graph;
        let full = GraphView::full(graph);
        let mut low_stress = GraphView::restrict(graph, config.max_stress);
        if let Some(mask) = plan.overrides.as_ref() {
            low_stress = low_stress.with_overrides(mask);
        }
        tracing::info!(
            full_edges = full.edge_count(),
            low_stress_edges = low_stress.edge_count(),
            max_stress = config.max_stress,
            "network views ready"
        );

        let pool_inputs = worker::PoolInputs {
            full,
            low_stress,
            attachments: &self.inputs.attachments,
            destinations: self.destinations(plan.restrict.as_ref()),
            params: SearchParams::from_config(config),
            scenario: plan.mode.scenario(),
        };
        let outcome = worker::run_pool(self.ctx, &pool_inputs, &plan.origins, store);

        report.origins_committed = outcome.committed;
        report.origins_failed = outcome.failed.len();
        report.origins_skipped = outcome.skipped;
        report.failed = outcome.failed;
        report.pairs = outcome.pairs;
        report.cancelled = outcome.cancelled;

        self.enter(RunPhase::Indexing);
        if plan.ops.contains(&PlannedOp::BuildIndexes) {
            let stats = store.build_indexes()?;
            tracing::info!(
                low_stress_rows = stats.low_stress_rows,
                high_stress_rows = stats.high_stress_rows,
                "built indexes"
            );
            report.index = Some(stats);
        }

        self.enter(RunPhase::Done);
        report.elapsed_ms = timer.elapsed().as_millis() as u64;
        tracing::info!(
            mode = %report.mode,
            committed = report.origins_committed,
            failed = report.origins_failed,
            pairs = report.pairs.total(),
            elapsed_ms = report.elapsed_ms,
            "run finished"
        );
        Ok(report)
    }

    /// Plan, then execute unless this is a dry run
    pub fn run(&self, mode: RunMode, store: &mut dyn ConnectivityStore) -> Result<RunReport> {
        let plan = self.plan(&mode, store)?;
        if self.ctx.dry_run {
            let mut report = self.empty_report(&mode, Utc::now());
            report.origins_total = plan.origins.len();
            report.plan = plan.ops;
            return Ok(report);
        }
        self.execute(plan, store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::Block;
    use crate::network::{EdgeRecord, NodeRecord};
    use crate::store::MemoryStore;

    fn inputs() -> RunInputs {
        let nodes: Vec<NodeRecord> = (1..=3)
            .map(|id| NodeRecord {
                node_id: id,
                x: id as f64 * 100.0,
                y: 0.0,
                road_id: None,
            })
            .collect();
        let edges = vec![
            EdgeRecord { edge_id: 1, from_node: 1, to_node: 2, cost: Some(100.0), stress: 1 },
            EdgeRecord { edge_id: 2, from_node: 2, to_node: 3, cost: Some(100.0), stress: 3 },
        ];
        let graph = Graph::build(&nodes, &edges).unwrap();
        let blocks = BlockSet::new(vec![
            Block::point(10, 100.0, 5.0),
            Block::point(20, 200.0, 5.0),
            Block::point(30, 300.0, 5.0),
        ])
        .unwrap();
        let projects: ProjectEdges = [(7, 2)].into_iter().collect();
        let config = ConnectivityConfig {
            min_segment_length: 0.0,
            ..ConnectivityConfig::default()
        };
        RunInputs::prepare(graph, blocks, projects, &config)
    }

    fn ctx() -> RunContext {
        RunContext::new(ConnectivityConfig {
            min_segment_length: 0.0,
            workers: 2,
            retry_backoff_ms: 0,
            ..ConnectivityConfig::default()
        })
    }

    #[test]
    fn test_fresh_plan_order() {
        let inputs = inputs();
        let ctx = ctx();
        let store = MemoryStore::new();
        let plan = Orchestrator::new(&ctx, &inputs)
            .plan(&RunMode::Fresh { overwrite: false }, &store)
            .unwrap();

        assert_eq!(plan.ops.first(), Some(&PlannedOp::CreateStore { overwrite: false }));
        assert_eq!(plan.ops[1], PlannedOp::DropIndexes);
        assert_eq!(plan.ops.last(), Some(&PlannedOp::BuildIndexes));
        assert_eq!(plan.origins(), &[10, 20, 30]);
    }

    #[test]
    fn test_fresh_into_existing_store_conflicts() {
        let inputs = inputs();
        let ctx = ctx();
        let mut store = MemoryStore::new();
        let orchestrator = Orchestrator::new(&ctx, &inputs);
        orchestrator.run(RunMode::Fresh { overwrite: false }, &mut store).unwrap();

        let err = orchestrator
            .run(RunMode::Fresh { overwrite: false }, &mut store)
            .unwrap_err();
        assert!(matches!(err, Error::StoreConflict(_)));
        orchestrator.run(RunMode::Fresh { overwrite: true }, &mut store).unwrap();
    }

    #[test]
    fn test_fresh_run_classifies_chain() {
        let inputs = inputs();
        let ctx = ctx();
        let mut store = MemoryStore::new();
        let report = Orchestrator::new(&ctx, &inputs)
            .run(RunMode::Fresh { overwrite: false }, &mut store)
            .unwrap();

        assert_eq!(report.origins_committed, 3);
        assert!(report.failed.is_empty());
        assert!(store.indexes_valid());
        use crate::evaluate::Connectivity::*;
        assert_eq!(store.lookup(10, 20, None).unwrap(), Some(BothConnected));
        assert_eq!(store.lookup(10, 30, None).unwrap(), Some(HighStressOnly));
        assert_eq!(store.lookup(30, 10, None).unwrap(), Some(Disconnected));
    }

    #[test]
    fn test_scenario_upgrades_project_edge() {
        let inputs = inputs();
        let ctx = ctx();
        let mut store = MemoryStore::new();
        let orchestrator = Orchestrator::new(&ctx, &inputs);
        orchestrator.run(RunMode::Fresh { overwrite: false }, &mut store).unwrap();

        let request = ScenarioRequest {
            project_id: 7,
            subtract: false,
        };
        let mode = RunMode::Scenario {
            request,
            origins: None,
        };
        let report = orchestrator.run(mode.clone(), &mut store).unwrap();
        assert_eq!(report.scenario, Some(request.tag()));
        assert_eq!(
            store.lookup(10, 30, Some(request.tag())).unwrap(),
            Some(crate::evaluate::Connectivity::BothConnected)
        );

        // Re-running replaces rather than duplicates
        let again = orchestrator.run(mode, &mut store).unwrap();
        assert!(again.rows_deleted > 0);
        assert!(again.failed.is_empty());
    }

    #[test]
    fn test_scenario_rejects_conflicting_max_stress() {
        let inputs = inputs();
        let mut store = MemoryStore::new();
        Orchestrator::new(&ctx(), &inputs)
            .run(RunMode::Fresh { overwrite: false }, &mut store)
            .unwrap();

        // Scenario runs reuse the base run's max_stress
        let mut stricter = ctx();
        stricter.config.max_stress = 3;
        let mode = RunMode::Scenario {
            request: ScenarioRequest {
                project_id: 7,
                subtract: false,
            },
            origins: None,
        };
        let err = Orchestrator::new(&stricter, &inputs)
            .run(mode, &mut store)
            .unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("max_stress")));
    }

    #[test]
    fn test_append_rejects_unknown_origin() {
        let inputs = inputs();
        let ctx = ctx();
        let mut store = MemoryStore::new();
        let orchestrator = Orchestrator::new(&ctx, &inputs);
        orchestrator.run(RunMode::Fresh { overwrite: false }, &mut store).unwrap();

        let err = orchestrator
            .run(RunMode::Append { origins: vec![99] }, &mut store)
            .unwrap_err();
        assert!(matches!(err, Error::DataIntegrity(_)));
    }
}
