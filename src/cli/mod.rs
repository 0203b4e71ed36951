//! Command-line interface for butterfly-connect

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Instant;

use butterfly_connect::network::load_graph;
use butterfly_connect::{
    BlockId, BlockSet, ConnectivityConfig, ConnectivityStore, FileStore, Orchestrator,
    ProjectEdges, RunContext, RunInputs, RunMode, RunReport, ScenarioRequest, ScenarioSelector,
    ScenarioTag, StressFilter,
};

#[derive(Parser)]
#[command(name = "butterfly-connect")]
#[command(about = "Low-stress bicycle connectivity between census blocks", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Network, block and store locations
#[derive(Args, Debug, Clone)]
pub struct InputArgs {
    /// Node table: node_id,x,y[,road_id]
    #[arg(long)]
    pub nodes: PathBuf,

    /// Directed edge table: edge_id,from_node,to_node,cost,stress
    #[arg(long)]
    pub edges: PathBuf,

    /// Block table: block_id,population,x,y[,outline]
    #[arg(long)]
    pub blocks: PathBuf,

    /// Store directory
    #[arg(long)]
    pub store: PathBuf,

    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Overrides for configuration fields
#[derive(Args, Debug, Clone, Default)]
pub struct ParamArgs {
    /// Cost ceiling for a connection
    #[arg(long)]
    pub max_distance: Option<f64>,

    /// Allowed low-stress detour, in percent
    #[arg(long)]
    pub max_detour_pct: Option<f64>,

    /// Highest stress level in the low-stress network
    #[arg(long)]
    pub max_stress: Option<u8>,

    /// Block snapping tolerance
    #[arg(long)]
    pub tolerance: Option<f64>,

    /// Minimum dangling segment length for an access node
    #[arg(long)]
    pub min_segment_length: Option<f64>,

    /// Worker threads
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Priority-queue budget per search
    #[arg(long)]
    pub max_frontier: Option<usize>,

    /// Print the planned operations instead of running them
    #[arg(long)]
    pub dry_run: bool,

    /// Hide the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Level {
    Low,
    High,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Evaluate every block into a new store
    Build {
        #[command(flatten)]
        input: InputArgs,

        #[command(flatten)]
        params: ParamArgs,

        /// Replace an existing store
        #[arg(long)]
        overwrite: bool,
    },

    /// Evaluate additional origins into an existing store
    Append {
        #[command(flatten)]
        input: InputArgs,

        #[command(flatten)]
        params: ParamArgs,

        /// Origin ids, one per line, or a run report whose failed origins to retry
        #[arg(long)]
        origins: PathBuf,
    },

    /// Recompute connectivity with a project's edges treated as low stress
    Scenario {
        #[command(flatten)]
        input: InputArgs,

        #[command(flatten)]
        params: ParamArgs,

        /// Project edge table: project_id,edge_id
        #[arg(long)]
        projects: PathBuf,

        /// Project to apply
        #[arg(long)]
        project: i64,

        /// Apply every project except this one
        #[arg(long)]
        subtract: bool,

        /// Restrict origins (defaults to blocks near the project)
        #[arg(long)]
        origins: Option<PathBuf>,
    },

    /// Delete a scenario's rows (or every scenario's) and rebuild indexes
    DeleteScenario {
        #[arg(long)]
        store: PathBuf,

        #[arg(long, required_unless_present = "all")]
        project: Option<i64>,

        #[arg(long)]
        subtract: bool,

        /// Delete all scenarios, keeping the base rows
        #[arg(long, conflicts_with = "project")]
        all: bool,
    },

    /// Build the partial indexes, or check whether they are current
    Index {
        #[arg(long)]
        store: PathBuf,

        /// Only report index validity
        #[arg(long)]
        check: bool,
    },

    /// Look up one pair, or list connected targets of a source
    Query {
        #[arg(long)]
        store: PathBuf,

        #[arg(long)]
        source: BlockId,

        #[arg(long)]
        target: Option<BlockId>,

        #[arg(long, value_enum, default_value = "low")]
        level: Level,

        /// Scenario project id (base rows when absent)
        #[arg(long)]
        project: Option<i64>,

        #[arg(long)]
        subtract: bool,
    },

    /// Re-check every batch checksum in a store
    Verify {
        #[arg(long)]
        store: PathBuf,
    },
}

fn resolve_config(input: &InputArgs, params: &ParamArgs) -> Result<ConnectivityConfig> {
    let mut config = match &input.config {
        Some(path) => ConnectivityConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ConnectivityConfig::default(),
    };
    if let Some(v) = params.max_distance {
        config.max_distance = v;
    }
    if let Some(v) = params.max_detour_pct {
        config.max_detour_pct = v;
    }
    if let Some(v) = params.max_stress {
        config.max_stress = v;
    }
    if let Some(v) = params.tolerance {
        config.tolerance = v;
    }
    if let Some(v) = params.min_segment_length {
        config.min_segment_length = v;
    }
    if let Some(v) = params.workers {
        config.workers = v;
    }
    if let Some(v) = params.max_frontier {
        config.max_frontier = v;
    }
    config.validate()?;
    Ok(config)
}

/// Origin ids from a list file, or the failed origins of a `.json` report
pub fn read_origins(path: &Path) -> Result<Vec<BlockId>> {
    if path.extension().is_some_and(|ext| ext == "json") {
        let report = RunReport::read_json(path)
            .with_context(|| format!("Failed to read report {}", path.display()))?;
        return Ok(report.failed_origins());
    }

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read origins {}", path.display()))?;
    let mut origins = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let id = line.parse::<BlockId>().with_context(|| {
            format!("{}:{}: '{}' is not a block id", path.display(), lineno + 1, line)
        })?;
        origins.push(id);
    }
    Ok(origins)
}

fn load_inputs(
    input: &InputArgs,
    projects: Option<&Path>,
    config: &ConnectivityConfig,
) -> Result<RunInputs> {
    let start = Instant::now();
    println!("🦋 Loading network and blocks");

    let graph = load_graph(&input.nodes, &input.edges).with_context(|| {
        format!(
            "Failed to load network from {} and {}",
            input.nodes.display(),
            input.edges.display()
        )
    })?;
    let blocks = BlockSet::read_csv(&input.blocks)
        .with_context(|| format!("Failed to load blocks from {}", input.blocks.display()))?;
    let projects = match projects {
        Some(path) => ProjectEdges::read_csv(path)
            .with_context(|| format!("Failed to load projects from {}", path.display()))?,
        None => ProjectEdges::default(),
    };

    let inputs = RunInputs::prepare(graph, blocks, projects, config);
    let stats = inputs.attachments.stats();
    println!(
        "  ✓ {} nodes, {} edges, {} blocks ({} attached, {} without access) in {:.2}s",
        inputs.graph.n_nodes(),
        inputs.graph.n_edges(),
        inputs.blocks.len(),
        stats.attached,
        stats.empty,
        start.elapsed().as_secs_f64()
    );
    Ok(inputs)
}

fn run_mode(
    input: &InputArgs,
    params: &ParamArgs,
    projects: Option<&Path>,
    mode: RunMode,
) -> Result<()> {
    let config = resolve_config(input, params)?;
    let inputs = load_inputs(input, projects, &config)?;
    let ctx = RunContext::new(config)
        .with_dry_run(params.dry_run)
        .with_progress(!params.no_progress);

    let mut store = FileStore::open(&input.store)
        .with_context(|| format!("Failed to open store {}", input.store.display()))?;

    let report = Orchestrator::new(&ctx, &inputs).run(mode, &mut store)?;

    if report.dry_run {
        println!("{}", serde_json::to_string_pretty(&report.plan)?);
        report.print_summary();
        return Ok(());
    }

    let report_path = input.store.join("reports").join(format!(
        "{}-{}.json",
        report.mode,
        Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
    ));
    report.write_json(&report_path)?;
    report.print_summary();
    println!("  Report: {}", report_path.display());
    Ok(())
}

fn open_existing(path: &Path) -> Result<FileStore> {
    let store = FileStore::open(path)
        .with_context(|| format!("Failed to open store {}", path.display()))?;
    if !store.exists() {
        bail!("No store at {}", path.display());
    }
    Ok(store)
}

fn scenario_key(project: Option<i64>, subtract: bool) -> Option<ScenarioTag> {
    project.map(|scenario_id| ScenarioTag {
        scenario_id,
        subtract,
    })
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Build {
                input,
                params,
                overwrite,
            } => run_mode(&input, &params, None, RunMode::Fresh { overwrite }),

            Commands::Append {
                input,
                params,
                origins,
            } => {
                let origins = read_origins(&origins)?;
                if origins.is_empty() {
                    bail!("No origins to append");
                }
                run_mode(&input, &params, None, RunMode::Append { origins })
            }

            Commands::Scenario {
                input,
                params,
                projects,
                project,
                subtract,
                origins,
            } => {
                let origins = origins.as_deref().map(read_origins).transpose()?;
                let request = ScenarioRequest {
                    project_id: project,
                    subtract,
                };
                run_mode(
                    &input,
                    &params,
                    Some(&projects),
                    RunMode::Scenario { request, origins },
                )
            }

            Commands::DeleteScenario {
                store,
                project,
                subtract,
                all,
            } => {
                let mut store = open_existing(&store)?;
                let selector = match scenario_key(project, subtract) {
                    Some(tag) if !all => ScenarioSelector::Scenario(tag),
                    _ => ScenarioSelector::AllScenarios,
                };
                let deleted = store.delete_rows(selector)?;
                let stats = store.build_indexes()?;
                println!("🗑️  Deleted {deleted} rows ({selector:?})");
                println!(
                    "  ✓ Indexes rebuilt: {} low-stress, {} high-stress rows",
                    stats.low_stress_rows, stats.high_stress_rows
                );
                Ok(())
            }

            Commands::Index { store, check } => {
                let mut store = open_existing(&store)?;
                if check {
                    if store.indexes_valid() {
                        println!("✅ Indexes are current");
                        Ok(())
                    } else {
                        bail!("Indexes are missing or stale");
                    }
                } else {
                    let stats = store.build_indexes()?;
                    println!(
                        "✅ Indexes built: {} low-stress, {} high-stress rows",
                        stats.low_stress_rows, stats.high_stress_rows
                    );
                    Ok(())
                }
            }

            Commands::Query {
                store,
                source,
                target,
                level,
                project,
                subtract,
            } => {
                let store = open_existing(&store)?;
                let scenario = scenario_key(project, subtract);
                match target {
                    Some(target) => match store.lookup(source, target, scenario)? {
                        Some(connectivity) => {
                            println!("{source},{target},{}", connectivity.code());
                        }
                        None => bail!("No row for ({source}, {target})"),
                    },
                    None => {
                        let filter = match level {
                            Level::Low => StressFilter::LowStress,
                            Level::High => StressFilter::HighStress,
                        };
                        for target in store.targets(source, filter, scenario)? {
                            println!("{target}");
                        }
                    }
                }
                Ok(())
            }

            Commands::Verify { store } => {
                let store = open_existing(&store)?;
                let report = store.verify()?;
                println!(
                    "✅ {} batches, {} pairs, {} bytes verified",
                    report.batches, report.pairs, report.bytes
                );
                if !report.indexes_valid {
                    println!("⚠️  Indexes are missing or stale; run `index`");
                }
                Ok(())
            }
        }
    }
}
