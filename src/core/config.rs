//! Run configuration
//!
//! Loaded from an optional TOML file, then overridden field by field from the
//! command line. Distances are in the projected units of the node table
//! (metres for the usual state-plane/UTM inputs).

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::error::{Error, Result};

/// Parameters for one connectivity run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectivityConfig {
    /// Cost ceiling for a path to count as a connection
    pub max_distance: f64,
    /// Extra cost a low-stress path may take over the shortest path, in percent
    pub max_detour_pct: f64,
    /// Highest stress level admitted into the low-stress network
    pub max_stress: u8,
    /// Snapping distance between a block and its access nodes
    pub tolerance: f64,
    /// Dangling segments shorter than this do not provide access
    pub min_segment_length: f64,
    /// Worker threads, each owning its own search scratch
    pub workers: usize,
    /// Priority-queue budget per search before the origin is failed
    pub max_frontier: usize,
    /// First backoff after a failed origin
    pub retry_backoff_ms: u64,
    /// Backoff ceiling
    pub max_backoff_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            max_distance: 2680.0,
            max_detour_pct: 25.0,
            max_stress: 1,
            tolerance: 15.0,
            min_segment_length: 30.0,
            workers: num_cpus::get(),
            max_frontier: 5_000_000,
            retry_backoff_ms: 250,
            max_backoff_ms: 5000,
        }
    }
}

impl ConnectivityConfig {
    /// Load from a TOML file; missing fields take their defaults
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Low-stress acceptance multiplier (always ≥ 1.0)
    pub fn detour_multiplier(&self) -> f64 {
        1.0 + self.max_detour_pct / 100.0
    }

    pub fn validate(&self) -> Result<()> {
        if !self.max_distance.is_finite() || self.max_distance <= 0.0 {
            return Err(Error::Config(format!(
                "max_distance must be positive and finite, got {}",
                self.max_distance
            )));
        }
        if !self.max_detour_pct.is_finite() || self.max_detour_pct < 0.0 {
            return Err(Error::Config(format!(
                "max_detour_pct must be ≥ 0, got {}",
                self.max_detour_pct
            )));
        }
        if self.max_stress == 0 {
            return Err(Error::Config("max_stress must be ≥ 1".to_string()));
        }
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(Error::Config(format!(
                "tolerance must be ≥ 0, got {}",
                self.tolerance
            )));
        }
        if !self.min_segment_length.is_finite() || self.min_segment_length < 0.0 {
            return Err(Error::Config(format!(
                "min_segment_length must be ≥ 0, got {}",
                self.min_segment_length
            )));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be ≥ 1".to_string()));
        }
        if self.max_frontier == 0 {
            return Err(Error::Config("max_frontier must be ≥ 1".to_string()));
        }
        if self.max_backoff_ms < self.retry_backoff_ms {
            return Err(Error::Config(format!(
                "max_backoff_ms ({}) is below retry_backoff_ms ({})",
                self.max_backoff_ms, self.retry_backoff_ms
            )));
        }
        Ok(())
    }
}
