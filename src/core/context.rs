//! Explicit run context handed to every component

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::config::ConnectivityConfig;

/// Everything a run needs besides its inputs: parameters, dry-run and
/// progress switches, and a shared cancel flag.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: ConnectivityConfig,
    pub dry_run: bool,
    pub show_progress: bool,
    cancelled: Arc<AtomicBool>,
}

impl RunContext {
    pub fn new(config: ConnectivityConfig) -> Self {
        Self {
            config,
            dry_run: false,
            show_progress: false,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Stop pulling new origins; in-flight origins finish normally
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Handle that can cancel this run from another thread
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}
