//! # butterfly-connect CLI
//!
//! Builds and maintains a low-stress connectivity store:
//!
//! ```text
//! butterfly-connect build --nodes n.csv --edges e.csv --blocks b.csv --store out
//! butterfly-connect append ... --origins retry.json
//! butterfly-connect scenario ... --projects p.csv --project 12
//! butterfly-connect query --store out --source 4 --level low
//! ```

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

fn main() {
    let cli = cli::Cli::parse();
    init_tracing(cli.log_json);

    if let Err(e) = cli.run() {
        eprintln!("❌ Error: {e:#}");
        std::process::exit(1);
    }
}
