#[path = "common/mod.rs"]
mod common;

use common::*;
use curetl::{
    parse_instant_millis, Amount, BasicLineClassifier, BillingBucket, CurProcessor, DiscountSchedule, FetchOutcome,
    Instances, LineKey, LocalObjectStore, MonthKey, ObjectStore, ObjectSummary, Watermark, staging_path,
};
use std::fs;
use std::path::Path;
use std::thread::sleep;
use std::time::{Duration, SystemTime};

fn ec2_key(usage_type: &str) -> LineKey {
    LineKey {
        account: "123456789012".to_string(),
        region: "us-east-1".to_string(),
        product: "Amazon Elastic Compute Cloud".to_string(),
        operation: "RunInstances".to_string(),
        usage_type: usage_type.to_string(),
    }
}

fn dollars(n: &str) -> Amount {
    Amount::parse(n).unwrap()
}

/// The reference month, end to end through resolve -> parallel shards -> merge -> replay:
/// - R1 and R3 land in hours 0 and 23; the purchase R2 is nowhere in the result.
/// - R4 (an RI fee) is deferred by the parallel pass and folded in by replay.
/// - The watermark is the end of R3: 2023-01-02T00:00:00Z.
/// - Staging is left empty and both EC2 resources are registered.
#[test]
fn month_202301_is_merged_replayed_and_complete_through_end_of_day() {
    let tmp = tempfile::tempdir().unwrap();
    let (store_root, _keys) = make_month_202301(tmp.path());
    let staging = tmp.path().join("staging");

    let store = LocalObjectStore::new(&store_root);
    let classifier = BasicLineClassifier::new();
    let processor = CurProcessor::new(&store, &classifier).staging_dir(&staging).threads(4);

    let reports = processor.resolve_reports(&[bucket()]);
    let month = MonthKey::new(2023, 1);
    assert_eq!(reports.keys().copied().collect::<Vec<_>>(), vec![month]);
    assert_eq!(reports[&month].len(), 1);
    assert_eq!(reports[&month][0].shard_keys.len(), 2);

    let instances = Instances::new();
    let res = processor.process_month(month, &reports[&month], Watermark::default(), &instances).unwrap();

    assert_eq!(res.shards, 2);
    assert_eq!(res.replayed, 1, "R4 must go through replay");
    assert_eq!(res.watermark.millis(), parse_instant_millis("2023-01-02T00:00:00Z").unwrap());

    let box_usage = ec2_key("BoxUsage:m5.large");
    assert_eq!(res.dataset.hourly_get(&box_usage, 0).unwrap().cost, dollars("1.0"));
    assert_eq!(res.dataset.hourly_get(&box_usage, 23).unwrap().cost, dollars("2.0"));
    let fee = ec2_key("HeavyUsage:m5.large");
    assert_eq!(res.dataset.hourly_get(&fee, 0).unwrap().cost, dollars("0.5"), "replayed fee missing");

    // R2 ($100 purchase) never counted
    assert_eq!(res.dataset.total().cost, dollars("3.5"));
    assert_eq!(res.dataset.monthly().count(), 0);

    assert_eq!(fs::read_dir(staging.join(BUCKET)).unwrap().count(), 0, "staging should be empty after success");
    assert_eq!(instances.len(), 2);
    assert!(instances.get("i-0002").is_some());
}

/// Re-running with the previous run's watermark: the manifest was not modified after it,
/// so no shard is fetched and the watermark comes back unchanged.
#[test]
fn rerun_with_prior_watermark_fetches_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let (store_root, _keys) = make_month_202301(tmp.path());
    let store = LocalObjectStore::new(&store_root);
    let classifier = BasicLineClassifier::new();
    let processor = CurProcessor::new(&store, &classifier).staging_dir(tmp.path().join("staging"));

    let instances = Instances::new();
    let first = processor.process_all(&[bucket()], Watermark::default(), &instances).unwrap();
    assert_eq!(first.len(), 1);
    let prior = first[0].watermark;

    let again = processor.process_all(&[bucket()], prior, &instances).unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].shards, 0);
    assert!(again[0].dataset.is_empty());
    assert_eq!(again[0].watermark, prior);
}

/// A shard listed by the manifest but missing from storage fails the whole month, and the
/// error names the shard.
#[test]
fn missing_shard_fails_the_month() {
    let tmp = tempfile::tempdir().unwrap();
    let (store_root, keys) = make_month_202301(tmp.path());
    fs::remove_file(object_path(&store_root, &keys[1])).unwrap();

    let store = LocalObjectStore::new(&store_root).with_backoff(1, 0);
    let classifier = BasicLineClassifier::new();
    let processor = CurProcessor::new(&store, &classifier).staging_dir(tmp.path().join("staging"));

    let reports = processor.resolve_reports(&[bucket()]);
    let month = MonthKey::new(2023, 1);
    let err = processor
        .process_month(month, &reports[&month], Watermark::default(), &Instances::new())
        .unwrap_err();
    let msg = format!("{:#}", err);
    assert!(msg.contains("b.zip"), "unexpected error: {msg}");
}

/// A `.gz` shard that is not gzip is a decode failure, not a silently empty shard.
#[test]
fn corrupt_gzip_shard_fails_the_month() {
    let tmp = tempfile::tempdir().unwrap();
    let (store_root, keys) = make_month_202301(tmp.path());
    let path_a = object_path(&store_root, &keys[0]);
    fs::write(&path_a, "identity/LineItemId,bill/BillType\nnot,gzip\n").unwrap();
    set_mtime(&path_a, at_unix(JAN_1_NOON));

    let store = LocalObjectStore::new(&store_root);
    let classifier = BasicLineClassifier::new();
    let processor = CurProcessor::new(&store, &classifier).staging_dir(tmp.path().join("staging")).threads(1);

    let res = processor.process_all(&[bucket()], Watermark::default(), &Instances::new());
    let msg = format!("{:#}", res.unwrap_err());
    assert!(msg.contains("a.csv.gz"), "unexpected error: {msg}");
}

/// A leftover staging file from an aborted run is replaced, not decoded as is.
#[test]
fn stale_staging_file_is_replaced() {
    let tmp = tempfile::tempdir().unwrap();
    let (store_root, _keys) = make_month_202301(tmp.path());
    let staging = tmp.path().join("staging");
    fs::create_dir_all(staging.join(BUCKET)).unwrap();
    fs::write(staging.join(BUCKET).join("a.csv.gz"), b"truncated download").unwrap();

    let store = LocalObjectStore::new(&store_root);
    let classifier = BasicLineClassifier::new();
    let processor = CurProcessor::new(&store, &classifier).staging_dir(&staging);

    let res = processor.process_all(&[bucket()], Watermark::default(), &Instances::new()).unwrap();
    assert_eq!(res[0].dataset.total().cost, dollars("3.5"));
    assert!(!staging.join(BUCKET).join("a.csv.gz").exists());
}

/// Thread count does not change the answer.
#[test]
fn single_and_multi_threaded_runs_agree() {
    let tmp = tempfile::tempdir().unwrap();
    let (store_root, _keys) = make_month_202301(tmp.path());
    let store = LocalObjectStore::new(&store_root);
    let classifier = BasicLineClassifier::new();

    let run = |threads: usize| {
        CurProcessor::new(&store, &classifier)
            .staging_dir(tmp.path().join(format!("staging-{threads}")))
            .threads(threads)
            .process_all(&[bucket()], Watermark::default(), &Instances::new())
            .unwrap()
            .remove(0)
    };
    let one = run(1);
    let many = run(8);
    assert_eq!(one.dataset, many.dataset);
    assert_eq!(one.watermark, many.watermark);
}

/// The month's discount is looked up once and applied to every shard's costs.
#[test]
fn month_discount_applies_to_all_shards() {
    let tmp = tempfile::tempdir().unwrap();
    let (store_root, _keys) = make_month_202301(tmp.path());
    let store = LocalObjectStore::new(&store_root);
    let classifier = BasicLineClassifier::new();
    let discounts = DiscountSchedule::new().with_step(MonthKey::new(2022, 6), 0.1);

    let res = CurProcessor::new(&store, &classifier)
        .discounts(&discounts)
        .staging_dir(tmp.path().join("staging"))
        .process_all(&[bucket()], Watermark::default(), &Instances::new())
        .unwrap();
    assert_eq!(res[0].dataset.total().cost, dollars("3.15"));
}

/// Shards already on disk go through the same merge/replay without fetching or deleting.
#[test]
fn local_files_are_processed_in_place() {
    let tmp = tempfile::tempdir().unwrap();
    let (store_root, keys) = make_month_202301(tmp.path());
    let files: Vec<_> = keys.iter().map(|k| object_path(&store_root, k)).collect();

    let classifier = BasicLineClassifier::new();
    let store = LocalObjectStore::new(&store_root);
    let res = CurProcessor::new(&store, &classifier)
        .process_local_files(MonthKey::new(2023, 1), "payer", &files, &Instances::new())
        .unwrap();

    assert_eq!(res.replayed, 1);
    assert_eq!(res.dataset.total().cost, dollars("3.5"));
    assert!(files.iter().all(|f| f.exists()));
}

/// Touching the manifest without changing any shard is still "nothing new": the rerun keeps
/// the prior watermark instead of falling back to the month start.
#[test]
fn retouched_manifest_over_unchanged_shards_keeps_watermark() {
    let tmp = tempfile::tempdir().unwrap();
    let (store_root, _keys) = make_month_202301(tmp.path());
    let store = LocalObjectStore::new(&store_root);
    let classifier = BasicLineClassifier::new();
    let processor = CurProcessor::new(&store, &classifier).staging_dir(tmp.path().join("staging"));

    let prior = processor.process_all(&[bucket()], Watermark::default(), &Instances::new()).unwrap()[0].watermark;

    let manifest = store_root.join(BUCKET).join(month_dir("20230101-20230201")).join("myreport-Manifest.json");
    set_mtime(&manifest, SystemTime::now());

    let again = processor.process_all(&[bucket()], prior, &Instances::new()).unwrap();
    assert_eq!(again[0].shards, 0);
    assert!(again[0].dataset.is_empty());
    assert_eq!(again[0].watermark, prior);
}

/// Only an early shard changed since the last run: its data is processed, but the watermark
/// stays at the prior value rather than dropping to that shard's end.
#[test]
fn changed_early_shard_never_moves_watermark_back() {
    let tmp = tempfile::tempdir().unwrap();
    let (store_root, keys) = make_month_202301(tmp.path());
    let store = LocalObjectStore::new(&store_root);
    let classifier = BasicLineClassifier::new();
    let processor = CurProcessor::new(&store, &classifier).staging_dir(tmp.path().join("staging"));

    let prior = processor.process_all(&[bucket()], Watermark::default(), &Instances::new()).unwrap()[0].watermark;

    let manifest = store_root.join(BUCKET).join(month_dir("20230101-20230201")).join("myreport-Manifest.json");
    set_mtime(&manifest, SystemTime::now());
    set_mtime(&object_path(&store_root, &keys[0]), SystemTime::now());

    let again = processor.process_all(&[bucket()], prior, &Instances::new()).unwrap();
    assert_eq!(again[0].shards, 2);
    assert_eq!(again[0].dataset.total().cost, dollars("1.0"));
    assert_eq!(again[0].watermark, prior);
}

/// Object store whose fetches linger after copying, so concurrent shards overlap on disk.
struct LingeringStore {
    inner: LocalObjectStore,
    linger: Duration,
}

impl ObjectStore for LingeringStore {
    fn list_objects(&self, bucket: &BillingBucket, prefix: &str) -> anyhow::Result<Vec<ObjectSummary>> {
        self.inner.list_objects(bucket, prefix)
    }

    fn read_object(&self, bucket: &BillingBucket, key: &str) -> anyhow::Result<Vec<u8>> {
        self.inner.read_object(bucket, key)
    }

    fn fetch_if_changed_since(
        &self,
        bucket: &BillingBucket,
        key: &str,
        local_path: &Path,
        since: Watermark,
    ) -> anyhow::Result<FetchOutcome> {
        let outcome = self.inner.fetch_if_changed_since(bucket, key, local_path, since)?;
        sleep(self.linger);
        Ok(outcome)
    }
}

/// Two buckets share a report name and so a shard key; both shards are staged side by side
/// and each is counted exactly once.
#[test]
fn same_key_in_two_buckets_is_staged_separately() {
    let tmp = tempfile::tempdir().unwrap();
    let (store_root, buckets, _key) = make_shared_key_buckets(tmp.path());
    let staging = tmp.path().join("staging");
    let store = LingeringStore { inner: LocalObjectStore::new(&store_root), linger: Duration::from_millis(300) };
    let classifier = BasicLineClassifier::new();

    let res = CurProcessor::new(&store, &classifier)
        .staging_dir(&staging)
        .threads(2)
        .process_all(&buckets, Watermark::default(), &Instances::new())
        .unwrap();

    assert_eq!(res.len(), 1);
    assert_eq!(res[0].shards, 2);
    assert_eq!(res[0].dataset.total().cost, dollars("11.0"));
    assert_eq!(res[0].dataset.hourly().count(), 2);
    assert_eq!(res[0].watermark.millis(), parse_instant_millis("2023-01-01T02:00:00Z").unwrap());
    for b in &buckets {
        assert_eq!(fs::read_dir(staging.join(&b.name)).unwrap().count(), 0);
    }
}

/// A row the classifier rejects is dropped on its own; the rows around it, and the
/// completeness they carry, still count.
#[test]
fn rejected_row_does_not_stop_its_shard() {
    let tmp = tempfile::tempdir().unwrap();
    let (store_root, keys) = make_month_202301(tmp.path());
    let path_a = object_path(&store_root, &keys[0]);
    write_gz(
        &path_a,
        &csv_text(&[
            line("r1", "Anniversary", "Usage", "2023-01-01T00:00:00Z", "2023-01-01T01:00:00Z", "1.0"),
            line("bad", "Anniversary", "Usage", "2023-01-01T05:00:00Z", "2023-01-01T06:00:00Z", "n/a"),
            line("late", "Anniversary", "Usage", "2023-01-03T00:00:00Z", "2023-01-03T01:00:00Z", "0.25"),
        ]),
    );
    set_mtime(&path_a, at_unix(JAN_1_NOON));

    let store = LocalObjectStore::new(&store_root);
    let classifier = BasicLineClassifier::new();
    let res = CurProcessor::new(&store, &classifier)
        .staging_dir(tmp.path().join("staging"))
        .process_all(&[bucket()], Watermark::default(), &Instances::new())
        .unwrap();

    // 1.0 + 0.25 from a, 2.0 + replayed 0.5 from b
    assert_eq!(res[0].dataset.total().cost, dollars("3.75"));
    assert_eq!(res[0].watermark.millis(), parse_instant_millis("2023-01-03T01:00:00Z").unwrap());
    assert_eq!(res[0].replayed, 1);
}

#[test]
fn staging_path_is_per_bucket() {
    let dir = Path::new("/stage");
    let key = "cur/myreport/20230101-20230201/asm/myreport-00001.csv.gz";
    let a = staging_path(dir, "payer-a", key).unwrap();
    let b = staging_path(dir, "payer-b", key).unwrap();
    assert_eq!(a, Path::new("/stage/payer-a/myreport-00001.csv.gz"));
    assert_ne!(a, b);
    assert!(staging_path(dir, "a/b", key).is_err());
    assert!(staging_path(dir, "payer-a", "cur/").is_err());
}
