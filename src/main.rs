use anyhow::Result;
use curetl::{
    BasicLineClassifier, BillingBucket, CurProcessor, Instances, LocalObjectStore, ProcessorOptions, Watermark,
};

const STORE_ROOT: &str = "./billing";
const STAGING_ROOT: &str = "./cur_staging";

fn main() -> Result<()> {
    curetl::init_tracing_once();

    let store = LocalObjectStore::new(STORE_ROOT);
    let opts = ProcessorOptions::default()
        .with_staging_dir(STAGING_ROOT)
        .with_progress(true)
        .merge_env();
    let classifier = BasicLineClassifier::from_options(&opts);

    let buckets = vec![
        BillingBucket::new("payer-billing", "cur/hourly-cost-and-usage").with_account("123456789012"),
    ];

    let instances = Instances::new();
    let results = CurProcessor::new(&store, &classifier)
        .options(opts)
        .process_all(&buckets, Watermark::default(), &instances)?;

    for r in &results {
        let total = r.dataset.total();
        println!(
            "{}: {} shards, {} replayed, cost {}, complete through {}",
            r.month, r.shards, r.replayed, total.cost, r.watermark
        );
    }
    println!("Tracked {} resources", instances.len());
    Ok(())
}
