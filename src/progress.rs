//! Shard progress bars, one per month, optionally grouped under a caller-owned MultiProgress.

use crate::date::MonthKey;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

static GLOBAL_MP: OnceLock<Arc<MultiProgress>> = OnceLock::new();

/// Render all month bars inside `mp` (e.g. next to the caller's own bars).
/// Only the first call has an effect.
pub fn set_global_multiprogress(mp: Arc<MultiProgress>) {
    let _ = GLOBAL_MP.set(mp);
}

const SHARD_TEMPLATE: &str = "{spinner:.green} {msg} {pos}/{len} shards [{bar:.cyan/blue}] {percent:>3}%  \
                              elapsed: {elapsed_precise}  eta: {eta_precise}";

/// Bar counting completed shards of `month`; `None` when progress is off.
pub(crate) fn shard_progress(month: MonthKey, shards: usize, enabled: bool) -> Option<ProgressBar> {
    if !enabled {
        return None;
    }
    let bar = ProgressBar::new(shards as u64);
    let pb = match GLOBAL_MP.get() {
        Some(mp) => mp.add(bar),
        None => bar,
    };
    if let Ok(style) = ProgressStyle::with_template(SHARD_TEMPLATE) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(format!("Month {month}"));
    pb.enable_steady_tick(Duration::from_millis(100));
    Some(pb)
}
