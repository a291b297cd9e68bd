//! Object storage collaborator: listing, small reads, and conditional fetch to local staging.

use crate::config::BillingBucket;
use crate::util::{copy_with_backoff, open_with_backoff};
use crate::watermark::Watermark;
use anyhow::{bail, Context, Result};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: Watermark,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched,
    /// Remote object not modified after the `since` instant; nothing written locally.
    Unchanged,
}

/// Retry/backoff is the implementation's business; callers treat any error as final.
pub trait ObjectStore: Send + Sync {
    fn list_objects(&self, bucket: &BillingBucket, prefix: &str) -> Result<Vec<ObjectSummary>>;

    fn read_object(&self, bucket: &BillingBucket, key: &str) -> Result<Vec<u8>>;

    fn fetch_if_changed_since(
        &self,
        bucket: &BillingBucket,
        key: &str,
        local_path: &Path,
        since: Watermark,
    ) -> Result<FetchOutcome>;
}

/// Directory mirror of object storage: `<root>/<bucket name>/<key>`.
/// Last-modified is the file's mtime.
#[derive(Clone, Debug)]
pub struct LocalObjectStore {
    root: PathBuf,
    tries: usize,
    delay_ms: u64,
}

impl LocalObjectStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self { root: root.as_ref().to_path_buf(), tries: 16, delay_ms: 50 }
    }

    pub fn with_backoff(mut self, tries: usize, delay_ms: u64) -> Self {
        self.tries = tries.max(1);
        self.delay_ms = delay_ms;
        self
    }

    pub fn bucket_dir(&self, bucket: &BillingBucket) -> PathBuf {
        self.root.join(&bucket.name)
    }

    fn object_path(&self, bucket: &BillingBucket, key: &str) -> Result<PathBuf> {
        if key.split('/').any(|c| c == "..") {
            bail!("object key escapes bucket: {}", key);
        }
        Ok(self.bucket_dir(bucket).join(key.trim_start_matches('/')))
    }
}

fn modified_millis(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl ObjectStore for LocalObjectStore {
    fn list_objects(&self, bucket: &BillingBucket, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let dir = self.bucket_dir(bucket);
        if !dir.is_dir() {
            bail!("bucket {} not found under {}", bucket.name, self.root.display());
        }
        let mut out = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1).sort_by_file_name() {
            let ent = entry.with_context(|| format!("list bucket {}", bucket.name))?;
            if !ent.file_type().is_file() {
                continue;
            }
            let rel = match ent.path().strip_prefix(&dir) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let key = rel.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/");
            if !key.starts_with(prefix) {
                continue;
            }
            let meta = ent.metadata().with_context(|| format!("stat {}", ent.path().display()))?;
            out.push(ObjectSummary { key, size: meta.len(), last_modified: Watermark::from_millis(modified_millis(&meta)) });
        }
        Ok(out)
    }

    fn read_object(&self, bucket: &BillingBucket, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(bucket, key)?;
        let mut f = open_with_backoff(&path, self.tries, self.delay_ms)
            .with_context(|| format!("open {}/{}", bucket.name, key))?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).with_context(|| format!("read {}/{}", bucket.name, key))?;
        Ok(buf)
    }

    fn fetch_if_changed_since(
        &self,
        bucket: &BillingBucket,
        key: &str,
        local_path: &Path,
        since: Watermark,
    ) -> Result<FetchOutcome> {
        let path = self.object_path(bucket, key)?;
        let meta = fs::metadata(&path).with_context(|| format!("stat {}/{}", bucket.name, key))?;
        if modified_millis(&meta) <= since.millis() {
            return Ok(FetchOutcome::Unchanged);
        }
        copy_with_backoff(&path, local_path, self.tries, self.delay_ms)?;
        Ok(FetchOutcome::Fetched)
    }
}
