//! # butterfly-connect
//!
//! Low-stress bicycle connectivity between census blocks.
//!
//! For every pair of blocks within reach of each other, decide whether a
//! rider can get from one to the other at all, and whether they can do it on
//! streets no more stressful than a configured ceiling without a detour
//! longer than the allowed ratio. Results are persisted per origin into a
//! connectivity store that downstream scoring reads through two partial
//! indexes.
//!
//! ## Pipeline
//!
//! ```text
//! nodes.csv + edges.csv ─▶ Graph ─▶ GraphView (full / threshold)
//! blocks.csv ─▶ BlockSet ─▶ AttachmentIndex
//! Orchestrator ─▶ worker pool of Evaluators ─▶ single writer ─▶ ConnectivityStore
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use butterfly_connect::{
//!     BlockSet, ConnectivityConfig, FileStore, Orchestrator, ProjectEdges, RunContext,
//!     RunInputs, RunMode,
//! };
//! use std::path::Path;
//!
//! # fn main() -> butterfly_connect::Result<()> {
//! let config = ConnectivityConfig::default();
//! let graph = butterfly_connect::network::load_graph(Path::new("nodes.csv"), Path::new("edges.csv"))?;
//! let blocks = BlockSet::read_csv(Path::new("blocks.csv"))?;
//! let inputs = RunInputs::prepare(graph, blocks, ProjectEdges::default(), &config);
//!
//! let ctx = RunContext::new(config);
//! let mut store = FileStore::open("connectivity")?;
//! let report = Orchestrator::new(&ctx, &inputs).run(RunMode::Fresh { overwrite: false }, &mut store)?;
//! println!("{} origins committed", report.origins_committed);
//! # Ok(())
//! # }
//! ```

pub mod blocks;
pub mod core;
pub mod evaluate;
pub mod network;
pub mod orchestrate;
pub mod scenario;
pub mod store;

pub use crate::blocks::{attach, AttachmentIndex, Block, BlockId, BlockSet};
pub use crate::core::{ConnectivityConfig, Error, Result, RunContext};
pub use crate::evaluate::{Connectivity, Evaluator, SearchParams};
pub use crate::network::{EdgeMask, Graph, GraphView, StressLevel};
pub use crate::orchestrate::{
    Orchestrator, PlannedOp, RunInputs, RunMode, RunPhase, RunPlan, RunReport,
};
pub use crate::scenario::{affected_blocks, ProjectEdges, ScenarioRequest};
pub use crate::store::{
    ConnectivityStore, FileStore, MemoryStore, OriginBatch, PairRecord, ScenarioSelector,
    ScenarioTag, StoreError, StoreManifest, StressFilter,
};
