//! Progress bar for origin processing

use indicatif::{ProgressBar, ProgressStyle};

/// Progress bar over `total` origins; hidden unless `visible`
pub fn origin_progress(total: u64, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} origins ({percent}%) {per_sec} ETA: {eta} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb
}
