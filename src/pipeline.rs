use crate::aggregate::{AggregatedDataset, Aggregator};
use crate::classify::{Instances, LineClassifier};
use crate::concurrency::map_bounded;
use crate::config::{BillingBucket, ProcessorOptions};
use crate::date::MonthKey;
use crate::manifest::{resolve, ManifestDescriptor};
use crate::mem::MemoryThrottle;
use crate::pricing::{DiscountSource, NoDiscount};
use crate::progress::shard_progress;
use crate::store::ObjectStore;
use crate::task::{apply_row, process_file, run_shard, PartialAggregate, ShardEnv};
use crate::util::init_tracing_once;
use crate::watermark::Watermark;
use ahash::RandomState;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

static NO_DISCOUNT: NoDiscount = NoDiscount;

/// Month-level driver for Cost and Usage reports.
#[derive(Clone)]
pub struct CurProcessor<'a> {
    pub(crate) opts: ProcessorOptions,
    store: &'a dyn ObjectStore,
    classifier: &'a dyn LineClassifier,
    pricing: &'a dyn DiscountSource,
}

/// A fully processed month.
#[derive(Debug)]
pub struct MonthResult {
    pub month: MonthKey,
    pub dataset: AggregatedDataset,
    /// Data is complete up to and including this instant.
    pub watermark: Watermark,
    pub shards: usize,
    pub replayed: usize,
}

/// One unit of submitted work: a shard key and the bucket it lives in.
struct ShardJob {
    bucket: Arc<BillingBucket>,
    key: String,
}

impl<'a> CurProcessor<'a> {
    pub fn new(store: &'a dyn ObjectStore, classifier: &'a dyn LineClassifier) -> Self {
        Self { opts: ProcessorOptions::default(), store, classifier, pricing: &NO_DISCOUNT }
    }

    // -------- Builder methods --------
    pub fn options(mut self, opts: ProcessorOptions) -> Self { self.opts = opts; self }
    pub fn discounts(mut self, pricing: &'a dyn DiscountSource) -> Self { self.pricing = pricing; self }
    pub fn staging_dir(mut self, dir: impl AsRef<Path>) -> Self { self.opts = self.opts.with_staging_dir(dir); self }
    pub fn threads(mut self, n: usize) -> Self { self.opts = self.opts.with_threads(n); self }
    pub fn start(mut self, start: Option<MonthKey>) -> Self { self.opts = self.opts.with_start(start); self }
    pub fn cost_and_usage_start(mut self, start: Option<MonthKey>) -> Self { self.opts = self.opts.with_cost_and_usage_start(start); self }
    pub fn debug_manifest(mut self, month: impl Into<String>, manifest: impl Into<String>) -> Self { self.opts = self.opts.with_debug_manifest(month, manifest); self }
    pub fn include_retroactive(mut self, yes: bool) -> Self { self.opts = self.opts.with_include_retroactive(yes); self }
    pub fn progress(mut self, yes: bool) -> Self { self.opts = self.opts.with_progress(yes); self }
    pub fn io_read_buffer(mut self, bytes: usize) -> Self { self.opts = self.opts.with_io_read_buffer(bytes); self }
    pub fn low_memory_threshold(mut self, fraction: f64) -> Self { self.opts = self.opts.with_low_memory_threshold(fraction); self }

    pub fn opts(&self) -> &ProcessorOptions {
        &self.opts
    }

    /// Month -> manifests across all billing buckets, oldest month first.
    pub fn resolve_reports(&self, buckets: &[BillingBucket]) -> BTreeMap<MonthKey, Vec<ManifestDescriptor>> {
        init_tracing_once();
        resolve(self.store, buckets, &self.opts)
    }

    /// Process one month: fetch and decode every shard in parallel, merge, then replay the
    /// deferred rows in submission order. Any shard failure fails the month.
    pub fn process_month(
        &self,
        month: MonthKey,
        manifests: &[ManifestDescriptor],
        last_processed: Watermark,
        instances: &Instances,
    ) -> Result<MonthResult> {
        init_tracing_once();
        let jobs = collect_shards(manifests, last_processed);
        if jobs.is_empty() {
            tracing::info!("month {}: no changed shards since {}", month, last_processed);
            return Ok(MonthResult { month, dataset: AggregatedDataset::new(), watermark: last_processed, shards: 0, replayed: 0 });
        }

        fs::create_dir_all(&self.opts.staging_dir)
            .with_context(|| format!("create staging dir {}", self.opts.staging_dir.display()))?;
        let env = self.shard_env(month, instances);
        tracing::info!(
            "month {}: {} shards from {} manifests, discount {}",
            month,
            jobs.len(),
            manifests.len(),
            env.discount
        );

        let pb = shard_progress(month, jobs.len(), self.opts.progress);

        let parts = map_bounded(&jobs, self.opts.threads, |job| {
            let part = run_shard(&env, &job.bucket, &job.key, last_processed)
                .with_context(|| format!("shard {} of month {}", job.key, month));
            if let Some(pb) = &pb { pb.inc(1); }
            part
        });
        if let Some(pb) = &pb { pb.finish_with_message(format!("Month {month} shards done")); }
        let parts = parts?;

        // A re-touched manifest over unchanged shards is still nothing new.
        if parts.iter().all(|p| !p.fetched) {
            tracing::info!("month {}: all {} shards unchanged since {}", month, parts.len(), last_processed);
            return Ok(MonthResult { month, dataset: AggregatedDataset::new(), watermark: last_processed, shards: 0, replayed: 0 });
        }

        let roots: Vec<&str> = jobs.iter().map(|j| j.bucket.root_name.as_str()).collect();
        let floor = env.month_start.max(last_processed);
        Ok(self.finish_month(month, &env, parts, &roots, floor))
    }

    /// Same pipeline over shard files already on local disk; sequential, no fetch, inputs kept.
    pub fn process_local_files(
        &self,
        month: MonthKey,
        root_name: &str,
        files: &[PathBuf],
        instances: &Instances,
    ) -> Result<MonthResult> {
        init_tracing_once();
        let env = self.shard_env(month, instances);
        let mut parts = Vec::with_capacity(files.len());
        for file in files {
            let key = file.to_string_lossy();
            let part = process_file(&env, root_name, file, &key).with_context(|| format!("month {}", month))?;
            parts.push(part);
        }
        let roots = vec![root_name; parts.len()];
        Ok(self.finish_month(month, &env, parts, &roots, env.month_start))
    }

    /// Resolve and process every month in order. Stops at the first failed month.
    pub fn process_all(
        &self,
        buckets: &[BillingBucket],
        last_processed: Watermark,
        instances: &Instances,
    ) -> Result<Vec<MonthResult>> {
        let reports = self.resolve_reports(buckets);
        if reports.is_empty() {
            tracing::warn!("No cost and usage manifests found. Check bucket prefixes and start dates.");
        }
        let mut out = Vec::with_capacity(reports.len());
        for (month, manifests) in reports {
            out.push(self.process_month(month, &manifests, last_processed, instances)?);
        }
        Ok(out)
    }

    fn shard_env<'e>(&'e self, month: MonthKey, instances: &'e Instances) -> ShardEnv<'e> {
        let month_start = Watermark::month_start(month);
        let discount = sanitize_discount(self.pricing.discount_for(month_start.millis()), month);
        ShardEnv {
            store: self.store,
            classifier: self.classifier,
            instances,
            staging_dir: &self.opts.staging_dir,
            month_start,
            discount,
            include_retroactive: self.opts.include_retroactive,
            read_buf_bytes: self.opts.read_buffer_bytes,
            throttle: MemoryThrottle::new(self.opts.low_memory_threshold),
        }
    }

    /// Merge the joined shard results, then replay deferred rows against the merged data.
    /// The watermark starts at `floor` and only moves forward from there.
    fn finish_month(
        &self,
        month: MonthKey,
        env: &ShardEnv<'_>,
        parts: Vec<PartialAggregate>,
        roots: &[&str],
        floor: Watermark,
    ) -> MonthResult {
        let shards = parts.len();
        let mut dataset = AggregatedDataset::new();
        let mut watermark = floor;
        let mut deferred = Vec::with_capacity(parts.len());
        for part in parts {
            dataset.merge(part.dataset);
            watermark = watermark.max(part.watermark);
            deferred.push(part.deferred);
        }
        tracing::info!("month {}: merged {} shards, provisional end {}", month, shards, watermark);

        let mut replayed = 0usize;
        for (rows, root) in deferred.into_iter().zip(roots) {
            let req = env.request(root, true);
            for row in rows {
                apply_row(env.classifier, &req, row, &mut dataset, env.instances, &mut watermark, None);
                replayed += 1;
            }
        }
        tracing::info!("month {}: replayed {} deferred rows, end is {}", month, replayed, watermark);

        MonthResult { month, dataset, watermark, shards, replayed }
    }
}

/// Distinct shard keys across the month's manifests, in manifest order. Manifests not
/// modified after `since` have nothing new to offer.
fn collect_shards(manifests: &[ManifestDescriptor], since: Watermark) -> Vec<ShardJob> {
    let mut seen: HashSet<(String, String), RandomState> = HashSet::default();
    let mut jobs = Vec::new();
    for m in manifests {
        if m.last_modified <= since {
            tracing::info!("manifest {} unchanged since {}", m.key, since);
            continue;
        }
        for key in &m.shard_keys {
            if seen.insert((m.bucket.name.clone(), key.clone())) {
                jobs.push(ShardJob { bucket: m.bucket.clone(), key: key.clone() });
            }
        }
    }
    jobs
}

fn sanitize_discount(d: f64, month: MonthKey) -> f64 {
    if (0.0..1.0).contains(&d) {
        d
    } else {
        tracing::warn!("discount {} for {} is outside [0,1); ignoring it", d, month);
        0.0
    }
}
