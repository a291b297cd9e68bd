//! Concurrency helper: run jobs on a bounded pool and join them all before returning.

use anyhow::{Context, Result};
use rayon::prelude::*;

/// Run `f` over `jobs` on a dedicated pool of `threads` workers (at least 1).
/// Results come back in submission order; the first failure fails the whole batch.
pub fn map_bounded<J, T, F>(jobs: &[J], threads: usize, f: F) -> Result<Vec<T>>
where
    J: Sync,
    T: Send,
    F: Sync + Fn(&J) -> Result<T>,
{
    let threads = threads.max(1);
    if threads == 1 || jobs.len() <= 1 {
        return jobs.iter().map(&f).collect();
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.min(jobs.len()))
        .thread_name(|i| format!("curetl-shard-{i}"))
        .build()
        .context("build shard worker pool")?;
    pool.install(|| jobs.par_iter().map(|job| f(job)).collect())
}
