//! Worker pool and single writer
//!
//! Origins flow through a bounded queue to `workers` threads. Each worker
//! owns an [`Evaluator`] (and with it a private search scratch) over the
//! shared read-only views. Results come back over a second channel to the
//! calling thread, which is the only one that touches the store.

use crossbeam_channel::{bounded, unbounded};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use super::progress::origin_progress;
use super::report::{FailedOrigin, PairCounts};
use crate::blocks::{AttachmentIndex, BlockId, BlockSet};
use crate::core::{Error, RunContext};
use crate::evaluate::{Connectivity, Evaluator, SearchParams};
use crate::network::GraphView;
use crate::store::{ConnectivityStore, OriginBatch, ScenarioTag};

/// Lifecycle of one origin within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginState {
    Pending,
    Processing,
    Committed,
    Failed,
}

/// Crow-flies destination candidates for an origin
#[derive(Debug, Clone, Copy)]
pub struct Destinations<'a> {
    pub blocks: &'a BlockSet,
    /// Restrict candidates to this set (scenario runs)
    pub restrict: Option<&'a BTreeSet<BlockId>>,
    pub max_distance: f64,
}

impl Destinations<'_> {
    pub fn for_origin(&self, origin: BlockId) -> Vec<BlockId> {
        let Some(block) = self.blocks.get(origin) else {
            return Vec::new();
        };
        let mut candidates = self.blocks.candidates_within(block, self.max_distance);
        if let Some(restrict) = self.restrict {
            candidates.retain(|id| *id == origin || restrict.contains(id));
        }
        candidates
    }
}

/// Doubling delay after failures, reset by a success
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        let initial = Duration::from_millis(initial_ms);
        Self {
            initial,
            max: Duration::from_millis(max_ms.max(initial_ms)),
            next: initial,
        }
    }

    /// Delay to wait after a failure
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    pub fn on_success(&mut self) {
        self.next = self.initial;
    }
}

/// Everything the workers share
pub(crate) struct PoolInputs<'a> {
    pub full: GraphView<'a>,
    pub low_stress: GraphView<'a>,
    pub attachments: &'a AttachmentIndex,
    pub destinations: Destinations<'a>,
    pub params: SearchParams,
    pub scenario: Option<ScenarioTag>,
}

#[derive(Debug, Default)]
pub(crate) struct PoolOutcome {
    pub committed: usize,
    pub failed: Vec<FailedOrigin>,
    pub skipped: usize,
    pub pairs: PairCounts,
    pub cancelled: bool,
}

enum WorkerEvent {
    Started(BlockId),
    Finished(BlockId, Result<Vec<(BlockId, Connectivity)>, String>),
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Evaluate and commit every origin; per-origin failures are collected
pub(crate) fn run_pool(
    ctx: &RunContext,
    inputs: &PoolInputs<'_>,
    origins: &[BlockId],
    store: &mut dyn ConnectivityStore,
) -> PoolOutcome {
    let workers = ctx.config.workers.max(1);
    let max_frontier = ctx.config.max_frontier;
    let (job_tx, job_rx) = bounded::<BlockId>(workers * 4);
    let (event_tx, event_rx) = unbounded::<WorkerEvent>();

    let mut states: FxHashMap<BlockId, OriginState> =
        origins.iter().map(|&o| (o, OriginState::Pending)).collect();
    let mut outcome = PoolOutcome::default();
    let mut backoff = Backoff::new(ctx.config.retry_backoff_ms, ctx.config.max_backoff_ms);
    let pb = origin_progress(origins.len() as u64, ctx.show_progress);

    thread::scope(|s| {
        for worker in 0..workers {
            let job_rx = job_rx.clone();
            let event_tx = event_tx.clone();
            s.spawn(move || {
                let mut evaluator = Evaluator::new(
                    inputs.full,
                    inputs.low_stress,
                    inputs.attachments,
                    inputs.params,
                    max_frontier,
                );
                for origin in job_rx.iter() {
                    if event_tx.send(WorkerEvent::Started(origin)).is_err() {
                        break;
                    }
                    let candidates = inputs.destinations.for_origin(origin);
                    let result = match catch_unwind(AssertUnwindSafe(|| {
                        evaluator.evaluate(origin, &candidates)
                    })) {
                        Ok(Ok(pairs)) => Ok(pairs),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(payload) => Err(panic_message(payload)),
                    };
                    if event_tx.send(WorkerEvent::Finished(origin, result)).is_err() {
                        break;
                    }
                }
                tracing::debug!(worker, stats = ?evaluator.stats(), "worker finished");
            });
        }
        drop(job_rx);
        drop(event_tx);

        s.spawn(move || {
            for &origin in origins {
                if ctx.is_cancelled() {
                    break;
                }
                if job_tx.send(origin).is_err() {
                    break;
                }
            }
        });

        for event in event_rx.iter() {
            match event {
                WorkerEvent::Started(origin) => {
                    states.insert(origin, OriginState::Processing);
                }
                WorkerEvent::Finished(origin, result) => {
                    let committed = result.and_then(|pairs| {
                        let batch = OriginBatch {
                            origin,
                            scenario: inputs.scenario,
                            pairs,
                        };
                        store
                            .commit_origin(&batch)
                            .map(|_| batch)
                            .map_err(|e| e.to_string())
                    });

                    match committed {
                        Ok(batch) => {
                            for &(_, connectivity) in &batch.pairs {
                                outcome.pairs.add(connectivity);
                            }
                            outcome.committed += 1;
                            states.insert(origin, OriginState::Committed);
                            backoff.on_success();
                            tracing::debug!(origin, pairs = batch.pairs.len(), "committed origin");
                        }
                        Err(message) => {
                            let err = Error::OriginProcessing {
                                origin,
                                message: message.clone(),
                            };
                            tracing::warn!(%err, "origin failed; continuing");
                            outcome.failed.push(FailedOrigin {
                                origin,
                                error: message,
                            });
                            states.insert(origin, OriginState::Failed);
                            let delay = backoff.on_failure();
                            if !delay.is_zero() {
                                thread::sleep(delay);
                            }
                        }
                    }
                    pb.inc(1);
                }
            }
        }
    });

    pb.finish_and_clear();

    outcome.skipped = states
        .values()
        .filter(|&&state| state == OriginState::Pending)
        .count();
    outcome.cancelled = ctx.is_cancelled() && outcome.skipped > 0;
    outcome.failed.sort_by_key(|f| f.origin);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_ceiling_and_resets() {
        let mut backoff = Backoff::new(100, 350);
        assert_eq!(backoff.on_failure(), Duration::from_millis(100));
        assert_eq!(backoff.on_failure(), Duration::from_millis(200));
        assert_eq!(backoff.on_failure(), Duration::from_millis(350));
        assert_eq!(backoff.on_failure(), Duration::from_millis(350));
        backoff.on_success();
        assert_eq!(backoff.on_failure(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_saturates_at_a_huge_ceiling() {
        let mut backoff = Backoff::new(1000, u64::MAX);
        for _ in 0..200 {
            backoff.on_failure();
        }
        assert_eq!(backoff.on_failure(), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_panicking_origin_fails_alone_and_scratch_is_reused() {
        use crate::blocks::Block;
        use crate::core::ConnectivityConfig;
        use crate::network::{EdgeRecord, Graph, NodeRecord};
        use crate::store::{MemoryStore, StoreManifest};

        let nodes: Vec<NodeRecord> = (1..=3)
            .map(|id| NodeRecord {
                node_id: id,
                x: (id - 1) as f64 * 100.0,
                y: 0.0,
                road_id: None,
            })
            .collect();
        let edges: Vec<EdgeRecord> = [(1, 2), (2, 1), (2, 3), (3, 2)]
            .iter()
            .enumerate()
            .map(|(i, &(from_node, to_node))| EdgeRecord {
                edge_id: i as i64,
                from_node,
                to_node,
                cost: Some(100.0),
                stress: 1,
            })
            .collect();
        let graph = Graph::build(&nodes, &edges).unwrap();
        let blocks = BlockSet::new(vec![
            Block::point(20, 0.0, 0.0),
            Block::point(30, 100.0, 0.0),
            Block::point(10, 5000.0, 0.0),
            Block::point(11, 5010.0, 0.0),
        ])
        .unwrap();
        // Block 10 points at a node the graph does not have
        let attachments = AttachmentIndex::from_map([
            (10, vec![99]),
            (11, vec![2]),
            (20, vec![0]),
            (30, vec![1]),
        ]);

        let config = ConnectivityConfig {
            workers: 1,
            retry_backoff_ms: 0,
            max_backoff_ms: 0,
            max_distance: 500.0,
            ..ConnectivityConfig::default()
        };
        let ctx = RunContext::new(config.clone()).with_progress(false);
        let inputs = PoolInputs {
            full: GraphView::full(&graph),
            low_stress: GraphView::restrict(&graph, 1),
            attachments: &attachments,
            destinations: Destinations {
                blocks: &blocks,
                restrict: None,
                max_distance: config.max_distance,
            },
            params: SearchParams::from_config(&config),
            scenario: None,
        };
        let mut store = MemoryStore::new();
        store.create(false, StoreManifest::from_config(&config)).unwrap();

        let outcome = run_pool(&ctx, &inputs, &[10, 20, 30], &mut store);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].origin, 10);
        assert!(outcome.failed[0].error.starts_with("panic"));
        assert_eq!(outcome.committed, 2);

        let rows = store.rows().unwrap();
        assert!(rows.iter().all(|r| r.source != 10));
        // Same worker, same scratch: the later origins still see each other
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.connectivity == Connectivity::BothConnected));
    }

    #[test]
    fn test_panic_messages() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload), "panic: boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bad origin"));
        assert_eq!(panic_message(payload), "panic: bad origin");
    }
}
