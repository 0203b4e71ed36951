//! Error types for butterfly-connect
//!
//! Fatal conditions (`DataIntegrity`, `StoreConflict`, `Config`) abort a run
//! before anything is written. `OriginProcessing` is the recoverable kind: the
//! orchestrator isolates it to one origin and keeps going.

use thiserror::Error;

use crate::network::search::SearchError;
use crate::store::StoreError;

/// Main error type for butterfly-connect operations
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed network, block or project input
    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    /// Store already exists (fresh build without overwrite) or is missing
    #[error("store conflict: {0}")]
    StoreConflict(String),

    /// Invalid configuration or inconsistent scenario request
    #[error("configuration error: {0}")]
    Config(String),

    /// One origin failed; the run continues without it
    #[error("origin {origin} failed: {message}")]
    OriginProcessing { origin: i64, message: String },

    #[error("search error: {0}")]
    Search(#[from] SearchError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// True for errors that must stop the whole run
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::OriginProcessing { .. } | Error::Search(_))
    }
}

/// Convenience result type for butterfly-connect operations
pub type Result<T> = std::result::Result<T, Error>;
