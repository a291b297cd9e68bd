//! Manifest discovery: which monthly Cost and Usage reports exist in each billing bucket,
//! and which shard objects each of them enumerates.

use crate::config::{BillingBucket, ProcessorOptions};
use crate::date::MonthKey;
use crate::store::{ObjectStore, ObjectSummary};
use crate::util::key_dirname;
use crate::watermark::Watermark;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One resolved manifest for one (bucket, month) pair.
#[derive(Clone, Debug)]
pub struct ManifestDescriptor {
    pub key: String,
    pub bucket: Arc<BillingBucket>,
    pub month: MonthKey,
    pub last_modified: Watermark,
    pub shard_keys: Vec<String>,
}

/// Subset of the report manifest JSON we rely on.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestDoc {
    #[serde(default)]
    report_keys: Vec<String>,
}

/// Report name from a bucket prefix: its last path component.
/// Prefixes with fewer than two components belong to a different report family.
pub fn report_name(prefix: &str) -> Option<&str> {
    let parts: Vec<&str> = prefix.trim_end_matches('/').split('/').collect();
    if parts.len() < 2 {
        return None;
    }
    parts.last().copied().filter(|s| !s.is_empty())
}

/// Pattern for `<anything>/<YYYYMM>01-<YYYYMM>01/<report>-Manifest.json`.
pub fn manifest_pattern(report: &str) -> Regex {
    let re = format!(r"^.+/(\d{{6}})01-\d{{6}}01/{}-Manifest\.json$", regex::escape(report));
    // The only variable part is escaped, so the pattern is always valid.
    Regex::new(&re).expect("manifest pattern")
}

pub fn month_of_manifest(key: &str, pattern: &Regex) -> Option<MonthKey> {
    let caps = pattern.captures(key)?;
    MonthKey::parse_compact(&caps[1])
}

/// Debug hook: when `debug_month` occurs in `key`, swap the filename for `replacement`.
/// The directory part of the key is kept as is.
pub fn substitute_debug_manifest(key: &str, debug_month: &str, replacement: &str) -> Option<String> {
    if debug_month.is_empty() || !key.contains(debug_month) {
        return None;
    }
    let dir = key_dirname(key);
    if dir.is_empty() {
        Some(replacement.to_string())
    } else {
        Some(format!("{}/{}", dir, replacement))
    }
}

/// Latest-listed manifest per month for one bucket, filtered by the configured start months.
pub fn select_manifests(
    objects: Vec<ObjectSummary>,
    report: &str,
    opts: &ProcessorOptions,
) -> BTreeMap<MonthKey, ObjectSummary> {
    let pattern = manifest_pattern(report);
    let mut by_month = BTreeMap::new();
    for obj in objects {
        let month = match month_of_manifest(&obj.key, &pattern) {
            Some(m) => m,
            None => continue, // not a manifest we care about
        };
        if !opts.wants_month(month) {
            tracing::info!("ignoring manifest {} (before configured start)", obj.key);
            continue;
        }
        tracing::info!("using manifest {} ({} bytes)", obj.key, obj.size);
        by_month.insert(month, obj);
    }
    by_month
}

fn parse_manifest(bytes: &[u8]) -> Result<Vec<String>> {
    let doc: ManifestDoc = serde_json::from_slice(bytes)?;
    Ok(doc.report_keys)
}

/// Resolve every bucket's manifests into `month -> [descriptor]`, ordered by month.
/// Listing or manifest-read failures only drop the affected bucket or manifest.
pub fn resolve(
    store: &dyn ObjectStore,
    buckets: &[BillingBucket],
    opts: &ProcessorOptions,
) -> BTreeMap<MonthKey, Vec<ManifestDescriptor>> {
    let mut out: BTreeMap<MonthKey, Vec<ManifestDescriptor>> = BTreeMap::new();

    for bb in buckets {
        let report = match report_name(&bb.prefix) {
            Some(r) => r,
            None => {
                tracing::debug!("bucket {} prefix {:?} has no report name; skipping", bb.name, bb.prefix);
                continue;
            }
        };
        tracing::info!(
            "listing cost and usage reports in {} (role {:?}, external id {:?})",
            bb.name,
            bb.access_role,
            bb.external_id
        );
        let objects = match store.list_objects(bb, &bb.prefix) {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!("cannot list bucket {}: {:#}; skipping", bb.name, e);
                continue;
            }
        };
        tracing::info!("found {} objects in bucket {}", objects.len(), bb.name);

        let bucket = Arc::new(bb.clone());
        for (month, mut obj) in select_manifests(objects, report, opts) {
            if let (Some(dm), Some(alt)) = (opts.debug_month.as_deref(), opts.debug_manifest.as_deref()) {
                if let Some(k) = substitute_debug_manifest(&obj.key, dm, alt) {
                    tracing::info!("debug: substituting manifest {} for {}", k, obj.key);
                    obj.key = k;
                }
            }
            let parsed = store
                .read_object(&bucket, &obj.key)
                .and_then(|bytes| parse_manifest(&bytes))
                .with_context(|| format!("manifest {}/{}", bucket.name, obj.key));
            let shard_keys = match parsed {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!("{:#}; skipping", e);
                    continue;
                }
            };
            out.entry(month).or_default().push(ManifestDescriptor {
                key: obj.key,
                bucket: bucket.clone(),
                month,
                last_modified: obj.last_modified,
                shard_keys,
            });
        }
    }

    out
}
