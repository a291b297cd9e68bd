//! The unit of parallel work: fetch one shard, decode it, classify every row into a private
//! aggregate, and keep the rows that can only be resolved once the whole month is known.

use crate::aggregate::AggregatedDataset;
use crate::classify::{ClassifyRequest, Instances, LineClassifier};
use crate::config::BillingBucket;
use crate::decode::{for_each_row, DecodeStats};
use crate::mem::MemoryThrottle;
use crate::row::{LineOutcome, RawRow};
use crate::store::{FetchOutcome, ObjectStore};
use crate::util::{key_basename, remove_with_backoff};
use crate::watermark::Watermark;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

/// One shard's private result. Owned by its task until the join.
#[derive(Debug)]
pub struct PartialAggregate {
    pub shard_key: String,
    pub dataset: AggregatedDataset,
    pub deferred: Vec<RawRow>,
    pub watermark: Watermark,
    pub stats: DecodeStats,
    pub fetched: bool,
}

impl PartialAggregate {
    pub fn empty(shard_key: impl Into<String>, month_start: Watermark) -> Self {
        Self {
            shard_key: shard_key.into(),
            dataset: AggregatedDataset::new(),
            deferred: Vec::new(),
            watermark: month_start,
            stats: DecodeStats::default(),
            fetched: false,
        }
    }
}

/// Read-only state shared by every shard task of one month.
pub(crate) struct ShardEnv<'a> {
    pub store: &'a dyn ObjectStore,
    pub classifier: &'a dyn LineClassifier,
    pub instances: &'a Instances,
    pub staging_dir: &'a Path,
    pub month_start: Watermark,
    pub discount: f64,
    pub include_retroactive: bool,
    pub read_buf_bytes: usize,
    pub throttle: MemoryThrottle,
}

impl ShardEnv<'_> {
    pub fn request<'r>(&self, root_name: &'r str, is_replay: bool) -> ClassifyRequest<'r> {
        ClassifyRequest {
            month_start_millis: self.month_start.millis(),
            is_replay,
            root_name,
            include_retroactive: self.include_retroactive,
            discount: self.discount,
        }
    }
}

/// Local staging file for an object key: `<staging dir>/<bucket name>/<key basename>`.
/// Buckets often share report names, and so shard names; the bucket level keeps them apart.
pub fn staging_path(staging_dir: &Path, bucket: &str, key: &str) -> Result<PathBuf> {
    let name = key_basename(key);
    if name.is_empty() || name == "." || name == ".." {
        bail!("shard key {:?} has no file name", key);
    }
    if bucket.is_empty() || bucket.contains(['/', '\\']) || bucket == "." || bucket == ".." {
        bail!("bucket name {:?} is not usable as a staging directory", bucket);
    }
    Ok(staging_dir.join(bucket).join(name))
}

/// Fetch, decode, classify. Any error here is fatal for the shard (and so for the month).
pub(crate) fn run_shard(env: &ShardEnv<'_>, bucket: &BillingBucket, key: &str, since: Watermark) -> Result<PartialAggregate> {
    let local = staging_path(env.staging_dir, &bucket.name, key)?;

    // Files are deleted once processed, so a leftover one is from an aborted run.
    if local.exists() {
        tracing::info!("deleting stale staging file {}", local.display());
        remove_with_backoff(&local, 16, 50)?;
    }

    tracing::info!("fetching {}/{} ...", bucket.name, key);
    let outcome = env
        .store
        .fetch_if_changed_since(bucket, key, &local, since)
        .with_context(|| format!("fetch {}/{}", bucket.name, key))?;
    if outcome == FetchOutcome::Unchanged {
        tracing::info!("{}/{} unchanged since {}; nothing to do", bucket.name, key, since);
        return Ok(PartialAggregate::empty(key, env.month_start));
    }

    let mut part = process_file(env, &bucket.root_name, &local, key)?;
    part.fetched = true;
    remove_with_backoff(&local, 16, 50)?;
    Ok(part)
}

/// Decode and classify a shard that is already on local disk.
pub(crate) fn process_file(env: &ShardEnv<'_>, root_name: &str, path: &Path, key: &str) -> Result<PartialAggregate> {
    tracing::info!("processing {} ...", path.display());
    let req = env.request(root_name, false);
    let mut part = PartialAggregate::empty(key, env.month_start);
    let PartialAggregate { dataset, deferred, watermark, .. } = &mut part;

    let stats = for_each_row(path, env.read_buf_bytes, &env.throttle, |row| {
        apply_row(env.classifier, &req, row, dataset, env.instances, watermark, Some(&mut *deferred));
        Ok(())
    })?;
    part.stats = stats;

    tracing::info!(
        "done processing {}: {} rows, {} deferred, end is {}",
        path.display(),
        stats.rows,
        part.deferred.len(),
        part.watermark
    );
    Ok(part)
}

/// Shared per-row contract for the parallel pass (`deferred = Some`) and replay (`None`).
/// Row-level failures are logged and the row is dropped.
pub(crate) fn apply_row(
    classifier: &dyn LineClassifier,
    req: &ClassifyRequest<'_>,
    row: RawRow,
    dataset: &mut AggregatedDataset,
    instances: &Instances,
    watermark: &mut Watermark,
    deferred: Option<&mut Vec<RawRow>>,
) {
    if classifier.bill_type(&row).is_excluded() {
        return;
    }
    match classifier.classify(req, &row, dataset, instances) {
        Ok(LineOutcome::Hourly { span }) => watermark.advance(span.end_millis),
        Ok(LineOutcome::Delay) => match deferred {
            Some(list) => list.push(row),
            None => tracing::warn!("row still unresolved on replay, dropping: {}", row.joined()),
        },
        Ok(LineOutcome::Skip) | Ok(LineOutcome::Other) => {}
        Err(e) => tracing::warn!("skipping row {}: {:#}", row.joined(), e),
    }
}
