#![allow(dead_code)]

use curetl::{BillingBucket, Header, RawRow};
use serde_json::json;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const BUCKET: &str = "payer-billing";
pub const PREFIX: &str = "cur/myreport";
pub const REPORT: &str = "myreport";

/// Column layout used by every fixture shard (a realistic subset of a CUR export).
pub const COLUMNS: [&str; 15] = [
    "identity/LineItemId",
    "bill/BillType",
    "lineItem/LineItemType",
    "lineItem/UsageAccountId",
    "lineItem/UsageStartDate",
    "lineItem/UsageEndDate",
    "lineItem/ProductCode",
    "product/ProductName",
    "lineItem/UsageType",
    "lineItem/Operation",
    "lineItem/UsageAmount",
    "lineItem/UnblendedCost",
    "lineItem/NetUnblendedCost",
    "lineItem/ResourceId",
    "product/region",
];

/// One billing line; `line()` fills the usual EC2 defaults.
#[derive(Clone, Debug)]
pub struct Line {
    pub id: String,
    pub bill_type: String,
    pub line_type: String,
    pub account: String,
    pub start: String,
    pub end: String,
    pub usage_type: String,
    pub operation: String,
    pub usage: String,
    pub cost: String,
    pub net_cost: String,
    pub resource: String,
}

pub fn line(id: &str, bill_type: &str, line_type: &str, start: &str, end: &str, cost: &str) -> Line {
    Line {
        id: id.to_string(),
        bill_type: bill_type.to_string(),
        line_type: line_type.to_string(),
        account: "123456789012".to_string(),
        start: start.to_string(),
        end: end.to_string(),
        usage_type: "BoxUsage:m5.large".to_string(),
        operation: "RunInstances".to_string(),
        usage: "1".to_string(),
        cost: cost.to_string(),
        net_cost: String::new(),
        resource: String::new(),
    }
}

impl Line {
    pub fn operation(mut self, op: &str, usage_type: &str) -> Self {
        self.operation = op.to_string();
        self.usage_type = usage_type.to_string();
        self
    }
    pub fn resource(mut self, id: &str) -> Self {
        self.resource = id.to_string();
        self
    }
    pub fn net_cost(mut self, cost: &str) -> Self {
        self.net_cost = cost.to_string();
        self
    }
    pub fn usage(mut self, amount: &str) -> Self {
        self.usage = amount.to_string();
        self
    }

    pub fn fields(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.bill_type.clone(),
            self.line_type.clone(),
            self.account.clone(),
            self.start.clone(),
            self.end.clone(),
            "AmazonEC2".to_string(),
            "Amazon Elastic Compute Cloud".to_string(),
            self.usage_type.clone(),
            self.operation.clone(),
            self.usage.clone(),
            self.cost.clone(),
            self.net_cost.clone(),
            self.resource.clone(),
            "us-east-1".to_string(),
        ]
    }

    pub fn csv(&self) -> String {
        self.fields().join(",")
    }

    pub fn row(&self) -> RawRow {
        RawRow::from_values(header(), self.fields())
    }
}

pub fn header() -> Arc<Header> {
    Arc::new(Header::new(COLUMNS))
}

/// Header line followed by the given lines, newline-terminated.
pub fn csv_text(lines: &[Line]) -> String {
    let mut s = COLUMNS.join(",");
    s.push('\n');
    for l in lines {
        s.push_str(&l.csv());
        s.push('\n');
    }
    s
}

pub fn write_gz(path: &Path, text: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let f = File::create(path).unwrap();
    let mut enc = flate2::write::GzEncoder::new(f, flate2::Compression::default());
    enc.write_all(text.as_bytes()).unwrap();
    enc.finish().unwrap();
}

pub fn write_zst(path: &Path, text: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let f = File::create(path).unwrap();
    let mut enc = zstd::stream::write::Encoder::new(f, 3).unwrap();
    enc.write_all(text.as_bytes()).unwrap();
    enc.finish().unwrap();
}

/// Zip archive with one directory entry followed by the given (name, contents) entries.
pub fn write_zip(path: &Path, entries: &[(&str, String)]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let f = File::create(path).unwrap();
    let mut zw = zip::ZipWriter::new(f);
    zw.add_directory("parts/", zip::write::SimpleFileOptions::default()).unwrap();
    for (name, text) in entries {
        zw.start_file(*name, zip::write::SimpleFileOptions::default()).unwrap();
        zw.write_all(text.as_bytes()).unwrap();
    }
    zw.finish().unwrap();
}

pub fn set_mtime(path: &Path, t: SystemTime) {
    let f = File::options().write(true).open(path).unwrap();
    f.set_modified(t).unwrap();
}

pub fn at_unix(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

/// 2023-01-01T12:00:00Z: mid-way through the fixture month's first day.
pub const JAN_1_NOON: u64 = 1_672_574_400;

pub fn bucket() -> BillingBucket {
    BillingBucket::new(BUCKET, PREFIX).with_account("123456789012").with_root_name("payer")
}

pub fn month_dir(compact_month_range: &str) -> String {
    format!("{PREFIX}/{compact_month_range}")
}

/// Write a manifest enumerating `keys` at `<prefix>/<range>/<file_name>` in the fixture bucket.
pub fn write_manifest(store_root: &Path, range: &str, file_name: &str, keys: &[String]) -> PathBuf {
    write_manifest_in(store_root, BUCKET, range, file_name, keys)
}

pub fn write_manifest_in(store_root: &Path, bucket: &str, range: &str, file_name: &str, keys: &[String]) -> PathBuf {
    let path = store_root.join(bucket).join(month_dir(range)).join(file_name);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let doc = json!({
        "assemblyId": "0f0e0d0c",
        "reportKeys": keys,
        "columns": [
            {"category": "bill", "name": "BillType"},
            {"category": "lineItem", "name": "UsageStartDate"},
            {"category": "lineItem", "name": "UnblendedCost"}
        ],
        "billingPeriod": {"start": "20230101T000000.000Z", "end": "20230201T000000.000Z"}
    });
    fs::write(&path, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();
    path
}

pub fn object_path(store_root: &Path, key: &str) -> PathBuf {
    store_root.join(BUCKET).join(key)
}

/// Fixture month 2023-01:
/// - `a.csv.gz`: R1 hourly 00:00–01:00 ($1.00) and R2 a purchase ($100, must never count)
/// - `b.zip`: one CSV entry with R3 hourly 23:00–24:00 ($2.00) and R4 an RI fee ($0.50)
///   that is deferred on the first pass and folded in by replay.
/// All objects are stamped 2023-01-01T12:00Z so that re-runs with a later watermark see them
/// as unchanged. Returns (store root, shard keys).
pub fn make_month_202301(base: &Path) -> (PathBuf, Vec<String>) {
    let store_root = base.join("store");
    let range = "20230101-20230201";
    let key_a = format!("{}/0f0e0d0c/a.csv.gz", month_dir(range));
    let key_b = format!("{}/0f0e0d0c/b.zip", month_dir(range));

    let r1 = line("r1", "Anniversary", "Usage", "2023-01-01T00:00:00Z", "2023-01-01T01:00:00Z", "1.0").resource("i-0001");
    let r2 = line("r2", "Purchase", "Usage", "2023-01-01T00:00:00Z", "2023-01-01T01:00:00Z", "100.0");
    let r3 = line("r3", "Anniversary", "Usage", "2023-01-01T23:00:00Z", "2023-01-02T00:00:00Z", "2.0").resource("i-0002");
    let r4 = line("r4", "Anniversary", "RIFee", "2023-01-01T00:00:00Z", "2023-01-01T01:00:00Z", "0.5")
        .operation("RunInstances", "HeavyUsage:m5.large");

    let path_a = object_path(&store_root, &key_a);
    write_gz(&path_a, &csv_text(&[r1, r2]));
    let path_b = object_path(&store_root, &key_b);
    write_zip(&path_b, &[("parts/b-00001.csv", csv_text(&[r3, r4]))]);

    let keys = vec![key_a, key_b];
    let manifest = write_manifest(&store_root, range, &format!("{REPORT}-Manifest.json"), &keys);

    for p in [&path_a, &path_b, &manifest] {
        set_mtime(p, at_unix(JAN_1_NOON));
    }
    (store_root, keys)
}

/// Two payer buckets with the same report name, each holding one shard under the *same* key:
/// `payer-a` bills $1.00 in hour 0, `payer-b` bills $10.00 in hour 1.
/// Returns (store root, buckets, shared key).
pub fn make_shared_key_buckets(base: &Path) -> (PathBuf, Vec<BillingBucket>, String) {
    let store_root = base.join("store");
    let range = "20230101-20230201";
    let key = format!("{}/asm/{REPORT}-00001.csv.gz", month_dir(range));
    let shards = [
        ("payer-a", line("a1", "Anniversary", "Usage", "2023-01-01T00:00:00Z", "2023-01-01T01:00:00Z", "1.0")),
        ("payer-b", line("b1", "Anniversary", "Usage", "2023-01-01T01:00:00Z", "2023-01-01T02:00:00Z", "10.0")),
    ];
    let mut buckets = Vec::new();
    for (name, l) in shards {
        let shard = store_root.join(name).join(&key);
        write_gz(&shard, &csv_text(&[l]));
        let manifest = write_manifest_in(&store_root, name, range, &format!("{REPORT}-Manifest.json"), &[key.clone()]);
        for p in [&shard, &manifest] {
            set_mtime(p, at_unix(JAN_1_NOON));
        }
        buckets.push(BillingBucket::new(name, PREFIX).with_root_name(name));
    }
    (store_root, buckets, key)
}
