//! File store behaviour across process restarts

mod common;

use butterfly_connect::{
    Connectivity, ConnectivityStore, FileStore, Orchestrator, ProjectEdges, RunMode,
    ScenarioRequest, ScenarioSelector, StressFilter,
};
use common::*;
use std::fs::OpenOptions;
use std::io::Write;

fn built_store(dir: &std::path::Path) -> (butterfly_connect::RunInputs, butterfly_connect::ConnectivityConfig) {
    let (nodes, mut edges) = street(4, 1);
    // 3-4 is stress 4 until project 5 upgrades it
    for edge in edges.iter_mut().filter(|e| e.edge_id >= 300) {
        edge.stress = 4;
    }
    let projects: ProjectEdges = [(5, 300), (5, 301)].into_iter().collect();
    let config = config(2680.0, 25.0, 1);
    let inputs = inputs(&nodes, &edges, blocks_on(&nodes), projects, &config);

    let ctx = context(config.clone());
    let mut store = FileStore::open(dir).unwrap();
    Orchestrator::new(&ctx, &inputs)
        .run(RunMode::Fresh { overwrite: false }, &mut store)
        .unwrap();
    (inputs, config)
}

#[test]
fn torn_trailing_batch_is_dropped_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store");
    built_store(&path);

    let store = FileStore::open(&path).unwrap();
    let rows = store.rows().unwrap();
    assert!(store.indexes_valid());
    let pairs = path.join("pairs.bin");
    let len = std::fs::metadata(&pairs).unwrap().len();

    // A batch header cut short by a crash
    let mut file = OpenOptions::new().append(true).open(&pairs).unwrap();
    file.write_all(b"BATC\x01\x02\x03").unwrap();
    drop(file);

    let reopened = FileStore::open(&path).unwrap();
    assert_eq!(std::fs::metadata(&pairs).unwrap().len(), len);
    assert_eq!(reopened.rows().unwrap(), rows);
    assert!(reopened.indexes_valid());
    let report = reopened.verify().unwrap();
    assert_eq!(report.pairs, rows.len());
    assert_eq!(report.batches, 4);
}

#[test]
fn commits_make_indexes_stale_until_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store");
    let (inputs, config) = built_store(&path);

    let mut store = FileStore::open(&path).unwrap();
    assert!(store.indexes_valid());
    assert_eq!(
        store.targets(10, StressFilter::LowStress, None).unwrap(),
        vec![10, 20, 30]
    );
    assert_eq!(
        store.targets(10, StressFilter::HighStress, None).unwrap(),
        vec![10, 20, 30, 40]
    );

    // Scenario rows land, then the run rebuilds the indexes
    let request = ScenarioRequest {
        project_id: 5,
        subtract: false,
    };
    let tag = request.tag();
    let ctx = context(config);
    Orchestrator::new(&ctx, &inputs)
        .run(RunMode::Scenario { request, origins: Some(vec![10]) }, &mut store)
        .unwrap();
    assert!(store.indexes_valid());
    assert_eq!(
        store.targets(10, StressFilter::LowStress, Some(tag)).unwrap(),
        vec![10, 20, 30, 40]
    );

    store.drop_indexes().unwrap();
    assert!(!store.indexes_valid());
    assert!(store.targets(10, StressFilter::LowStress, None).is_err());
    // Point lookups do not need the indexes
    assert_eq!(
        store.lookup(10, 40, None).unwrap(),
        Some(Connectivity::HighStressOnly)
    );

    store.build_indexes().unwrap();
    let reopened = FileStore::open(&path).unwrap();
    assert!(reopened.indexes_valid());
}

#[test]
fn deleting_a_scenario_keeps_base_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store");
    let (inputs, config) = built_store(&path);
    let base = FileStore::open(&path).unwrap().rows().unwrap();

    let mut store = FileStore::open(&path).unwrap();
    let request = ScenarioRequest {
        project_id: 5,
        subtract: false,
    };
    let tag = request.tag();
    let ctx = context(config);
    let report = Orchestrator::new(&ctx, &inputs)
        .run(RunMode::Scenario { request, origins: None }, &mut store)
        .unwrap();
    assert!(store.has_rows(ScenarioSelector::Scenario(tag)).unwrap());

    let deleted = store.delete_rows(ScenarioSelector::Scenario(tag)).unwrap();
    assert_eq!(deleted, report.pairs.total());
    assert!(!store.indexes_valid());
    store.build_indexes().unwrap();

    let reopened = FileStore::open(&path).unwrap();
    assert!(!reopened.has_rows(ScenarioSelector::AllScenarios).unwrap());
    assert_eq!(reopened.rows().unwrap(), base);
    assert_eq!(reopened.lookup(10, 40, Some(tag)).unwrap(), None);
}

#[test]
fn fresh_run_refuses_existing_store_without_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store");
    let (inputs, config) = built_store(&path);

    let ctx = context(config);
    let mut store = FileStore::open(&path).unwrap();
    let err = Orchestrator::new(&ctx, &inputs)
        .run(RunMode::Fresh { overwrite: false }, &mut store)
        .unwrap_err();
    assert!(matches!(err, butterfly_connect::Error::StoreConflict(_)));

    let report = Orchestrator::new(&ctx, &inputs)
        .run(RunMode::Fresh { overwrite: true }, &mut store)
        .unwrap();
    assert_eq!(report.origins_committed, 4);
}

#[test]
fn manifest_mismatch_blocks_append() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store");
    let (inputs, config) = built_store(&path);

    let changed = butterfly_connect::ConnectivityConfig {
        max_stress: 2,
        ..config
    };
    let ctx = context(changed);
    let mut store = FileStore::open(&path).unwrap();
    let err = Orchestrator::new(&ctx, &inputs)
        .run(RunMode::Append { origins: vec![10] }, &mut store)
        .unwrap_err();
    assert!(matches!(err, butterfly_connect::Error::Config(_)));
}
