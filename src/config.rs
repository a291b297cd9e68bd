use crate::date::MonthKey;
use std::path::{Path, PathBuf};

/// One configured billing-report location plus the credentials used to reach it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BillingBucket {
    pub name: String,
    pub region: String,
    pub prefix: String,                  // e.g. "cur/hourly-report"
    pub account_id: String,              // payer account that owns the bucket
    pub access_role: Option<String>,     // role to assume, if any
    pub external_id: Option<String>,
    pub root_name: String,               // logical root passed to the classifier
}

impl BillingBucket {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            root_name: name.clone(),
            name,
            region: "us-east-1".to_string(),
            prefix: prefix.into(),
            account_id: String::new(),
            access_role: None,
            external_id: None,
        }
    }
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }
    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = account_id.into();
        self
    }
    pub fn with_role(mut self, role: impl Into<String>, external_id: Option<String>) -> Self {
        self.access_role = Some(role.into());
        self.external_id = external_id;
        self
    }
    pub fn with_root_name(mut self, root: impl Into<String>) -> Self {
        self.root_name = root.into();
        self
    }
}

/// Processor options with sensible defaults and builder chaining.
#[derive(Clone, Debug)]
pub struct ProcessorOptions {
    pub staging_dir: PathBuf,
    pub threads: usize,                        // shard worker pool size
    pub start: Option<MonthKey>,               // global start month (inclusive)
    pub cost_and_usage_start: Option<MonthKey>,// report-family start month (inclusive)
    pub debug_month: Option<String>,           // substring of a manifest key, e.g. "20190101-20190201"
    pub debug_manifest: Option<String>,        // replacement manifest filename
    pub include_retroactive: bool,
    pub use_blended: bool,
    pub net_unblended_start: Option<MonthKey>,
    pub progress: bool,

    // IO tuning
    pub read_buffer_bytes: usize,

    // cooperative backoff when available memory fraction drops below this
    pub low_memory_threshold: f64,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            staging_dir: std::env::temp_dir().join("curetl_staging"),
            threads: 5,
            start: None,
            cost_and_usage_start: None,
            debug_month: None,
            debug_manifest: None,
            include_retroactive: true,
            use_blended: false,
            net_unblended_start: None,
            progress: false,
            read_buffer_bytes: 256 * 1024,
            low_memory_threshold: 0.10,
        }
    }
}

impl ProcessorOptions {
    pub fn with_staging_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.staging_dir = dir.as_ref().to_path_buf();
        self
    }
    pub fn with_threads(mut self, n: usize) -> Self {
        self.threads = n.max(1);
        self
    }
    pub fn with_start(mut self, start: Option<MonthKey>) -> Self {
        self.start = start;
        self
    }
    pub fn with_cost_and_usage_start(mut self, start: Option<MonthKey>) -> Self {
        self.cost_and_usage_start = start;
        self
    }
    pub fn with_debug_manifest(mut self, month: impl Into<String>, manifest: impl Into<String>) -> Self {
        self.debug_month = Some(month.into());
        self.debug_manifest = Some(manifest.into());
        self
    }
    pub fn with_include_retroactive(mut self, yes: bool) -> Self {
        self.include_retroactive = yes;
        self
    }
    pub fn with_blended(mut self, yes: bool) -> Self {
        self.use_blended = yes;
        self
    }
    pub fn with_net_unblended_start(mut self, start: Option<MonthKey>) -> Self {
        self.net_unblended_start = start;
        self
    }
    pub fn with_progress(mut self, yes: bool) -> Self {
        self.progress = yes;
        self
    }
    pub fn with_io_read_buffer(mut self, bytes: usize) -> Self {
        self.read_buffer_bytes = bytes.max(8 * 1024);
        self
    }
    pub fn with_low_memory_threshold(mut self, fraction: f64) -> Self {
        self.low_memory_threshold = fraction.clamp(0.0, 1.0);
        self
    }

    /// A manifest month is wanted if it is not before either configured start.
    pub fn wants_month(&self, month: MonthKey) -> bool {
        let after = |bound: Option<MonthKey>| bound.map_or(true, |b| month >= b);
        after(self.start) && after(self.cost_and_usage_start)
    }

    /// Apply `CUR_*` environment overrides (used by the binary).
    /// - CUR_THREADS, CUR_STAGING_DIR, CUR_START, CUR_START_CUR
    /// - CUR_DEBUG_MONTH + CUR_DEBUG_MANIFEST (both required)
    pub fn merge_env(mut self) -> Self {
        if let Some(n) = env_parse::<usize>("CUR_THREADS") {
            self = self.with_threads(n);
        }
        if let Ok(dir) = std::env::var("CUR_STAGING_DIR") {
            if !dir.trim().is_empty() {
                self = self.with_staging_dir(dir.trim());
            }
        }
        if let Some(m) = env_parse::<MonthKey>("CUR_START") {
            self.start = Some(m);
        }
        if let Some(m) = env_parse::<MonthKey>("CUR_START_CUR") {
            self.cost_and_usage_start = Some(m);
        }
        match (std::env::var("CUR_DEBUG_MONTH"), std::env::var("CUR_DEBUG_MANIFEST")) {
            (Ok(month), Ok(manifest)) if !month.is_empty() && !manifest.is_empty() => {
                self = self.with_debug_manifest(month, manifest);
            }
            (Ok(_), Err(_)) => tracing::warn!("CUR_DEBUG_MONTH is set without CUR_DEBUG_MANIFEST; ignoring"),
            _ => {}
        }
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("{} is set but cannot be parsed: {}", key, raw);
            None
        }
    }
}
