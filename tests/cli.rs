//! Drive the binary over tiny CSV inputs

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const NODES: &str = "node_id,x,y\n1,100,0\n2,200,0\n3,300,0\n";
const EDGES: &str = "edge_id,from_node,to_node,cost,stress
100,1,2,100,1
101,2,1,100,1
200,2,3,100,4
201,3,2,100,4
";
const BLOCKS: &str = "block_id,population,x,y\n10,120,100,0\n20,80,200,0\n30,45,300,0\n";
const PROJECTS: &str = "project_id,edge_id\n7,200\n7,201\n";

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        for (name, body) in [
            ("nodes.csv", NODES),
            ("edges.csv", EDGES),
            ("blocks.csv", BLOCKS),
            ("projects.csv", PROJECTS),
        ] {
            std::fs::write(root.join(name), body).unwrap();
        }
        Self { _dir: dir, root }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn store(&self) -> PathBuf {
        self.path("store")
    }

    fn inputs(&self) -> Vec<String> {
        let arg = |p: &Path| p.display().to_string();
        vec![
            "--nodes".into(),
            arg(&self.path("nodes.csv")),
            "--edges".into(),
            arg(&self.path("edges.csv")),
            "--blocks".into(),
            arg(&self.path("blocks.csv")),
            "--store".into(),
            arg(&self.store()),
            "--tolerance".into(),
            "1".into(),
            "--min-segment-length".into(),
            "0".into(),
            "--workers".into(),
            "2".into(),
            "--no-progress".into(),
        ]
    }

    fn run(&self, args: &[String]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_butterfly-connect"))
            .args(args)
            .env("RUST_LOG", "warn")
            .output()
            .unwrap()
    }

    fn build(&self) {
        let mut args = vec!["build".to_string()];
        args.extend(self.inputs());
        let out = self.run(&args);
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    }
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

#[test]
fn build_then_query() {
    let fx = Fixture::new();
    fx.build();

    let store = fx.store().display().to_string();
    let out = fx.run(&[
        "query".into(), "--store".into(), store.clone(),
        "--source".into(), "10".into(), "--target".into(), "30".into(),
    ]);
    assert!(out.status.success());
    assert_eq!(stdout(&out).trim(), "10,30,1");

    let out = fx.run(&["query".into(), "--store".into(), store.clone(), "--source".into(), "10".into()]);
    assert_eq!(stdout(&out).lines().collect::<Vec<_>>(), vec!["10", "20"]);

    let out = fx.run(&["verify".into(), "--store".into(), store]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("3 batches"));

    let reports: Vec<_> = std::fs::read_dir(fx.store().join("reports")).unwrap().collect();
    assert_eq!(reports.len(), 1);
}

#[test]
fn scenario_dry_run_prints_plan_and_changes_nothing() {
    let fx = Fixture::new();
    fx.build();
    let before = std::fs::read(fx.store().join("pairs.bin")).unwrap();

    let mut args = vec!["scenario".to_string()];
    args.extend(fx.inputs());
    args.extend([
        "--projects".into(),
        fx.path("projects.csv").display().to_string(),
        "--project".into(),
        "7".into(),
        "--dry-run".into(),
    ]);
    let out = fx.run(&args);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let text = stdout(&out);
    assert!(text.contains("\"op\": \"delete_rows\""));
    assert!(text.contains("\"op\": \"evaluate_origin\""));
    assert_eq!(std::fs::read(fx.store().join("pairs.bin")).unwrap(), before);
}

#[test]
fn scenario_then_delete() {
    let fx = Fixture::new();
    fx.build();
    let store = fx.store().display().to_string();

    let mut args = vec!["scenario".to_string()];
    args.extend(fx.inputs());
    args.extend([
        "--projects".into(),
        fx.path("projects.csv").display().to_string(),
        "--project".into(),
        "7".into(),
    ]);
    assert!(fx.run(&args).status.success());

    let query = |fx: &Fixture| {
        fx.run(&[
            "query".into(), "--store".into(), store.clone(),
            "--source".into(), "10".into(), "--target".into(), "30".into(),
            "--project".into(), "7".into(),
        ])
    };
    assert_eq!(stdout(&query(&fx)).trim(), "10,30,3");

    let out = fx.run(&[
        "delete-scenario".into(), "--store".into(), store.clone(), "--project".into(), "7".into(),
    ]);
    assert!(out.status.success());
    assert!(!query(&fx).status.success());

    let out = fx.run(&["index".into(), "--store".into(), store, "--check".into()]);
    assert!(out.status.success());
}

#[test]
fn append_retries_origins_from_a_list() {
    let fx = Fixture::new();
    fx.build();
    std::fs::write(fx.path("origins.txt"), "# already present\n20\n").unwrap();

    let mut args = vec!["append".to_string()];
    args.extend(fx.inputs());
    args.extend(["--origins".into(), fx.path("origins.txt").display().to_string()]);
    let out = fx.run(&args);
    assert!(out.status.success());
    assert!(stdout(&out).contains("1 failed"));
}

#[test]
fn missing_store_is_an_error() {
    let fx = Fixture::new();
    let out = fx.run(&["verify".into(), "--store".into(), fx.store().display().to_string()]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("No store"));
}

#[test]
fn invalid_parameters_are_rejected() {
    let fx = Fixture::new();
    let mut args = vec!["build".to_string()];
    args.extend(fx.inputs());
    args.push("--max-detour-pct=-5".into());
    let out = fx.run(&args);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("max_detour_pct"));
    assert!(!fx.store().exists());
}
