//! Run report written next to the store after every run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use super::PlannedOp;
use crate::blocks::{AttachStats, BlockId};
use crate::core::error::Result;
use crate::evaluate::Connectivity;
use crate::store::{IndexStats, ScenarioTag};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedOrigin {
    pub origin: BlockId,
    pub error: String,
}

/// Committed pairs per class
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairCounts {
    pub disconnected: usize,
    pub high_stress_only: usize,
    pub both_connected: usize,
}

impl PairCounts {
    pub fn add(&mut self, connectivity: Connectivity) {
        match connectivity {
            Connectivity::Disconnected => self.disconnected += 1,
            Connectivity::HighStressOnly => self.high_stress_only += 1,
            Connectivity::BothConnected => self.both_connected += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.disconnected + self.high_stress_only + self.both_connected
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub mode: String,
    pub scenario: Option<ScenarioTag>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub dry_run: bool,
    pub cancelled: bool,
    pub origins_total: usize,
    pub origins_committed: usize,
    pub origins_failed: usize,
    /// Never pulled from the queue because the run was cancelled
    pub origins_skipped: usize,
    pub failed: Vec<FailedOrigin>,
    pub pairs: PairCounts,
    pub rows_deleted: usize,
    pub index: Option<IndexStats>,
    pub attachment: AttachStats,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plan: Vec<PlannedOp>,
}

impl RunReport {
    pub fn failed_origins(&self) -> Vec<BlockId> {
        self.failed.iter().map(|f| f.origin).collect()
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_json(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Print the butterfly-style summary to stdout
    pub fn print_summary(&self) {
        println!();
        if self.dry_run {
            println!("📝 Dry run: {} planned operations", self.plan.len());
            return;
        }
        println!("✅ {} run complete in {:.2}s", self.mode, self.elapsed_ms as f64 / 1000.0);
        if let Some(tag) = self.scenario {
            println!("  Scenario: {tag}");
        }
        println!(
            "  Origins: {} committed, {} failed, {} skipped (of {})",
            self.origins_committed, self.origins_failed, self.origins_skipped, self.origins_total
        );
        println!(
            "  Pairs: {} both, {} high-stress only, {} disconnected",
            self.pairs.both_connected, self.pairs.high_stress_only, self.pairs.disconnected
        );
        if self.rows_deleted > 0 {
            println!("  Rows deleted first: {}", self.rows_deleted);
        }
        if let Some(index) = self.index {
            println!(
                "  Indexes: {} low-stress rows, {} high-stress rows",
                index.low_stress_rows, index.high_stress_rows
            );
        }
        if self.cancelled {
            println!("⚠️  Run was cancelled before every origin was processed");
        }
        if !self.failed.is_empty() {
            println!("⚠️  Failed origins:");
            for failure in &self.failed {
                println!("    {}: {}", failure.origin, failure.error);
            }
        }
    }
}
