mod config;
mod date;
mod watermark;
mod util;
mod mem;
mod progress;
mod concurrency;

mod row;
mod aggregate;
mod decode;
mod classify;
mod pricing;
mod store;
mod manifest;
mod task;
mod pipeline;

pub use crate::config::{BillingBucket, ProcessorOptions};
pub use crate::date::{format_millis, parse_instant_millis, MonthKey};
pub use crate::watermark::Watermark;
pub use crate::pipeline::{CurProcessor, MonthResult};

// Row model and the classifier collaborator.
pub use crate::row::{BillType, Header, LineOutcome, LineSpan, RawRow};
pub use crate::classify::{columns, BasicLineClassifier, ClassifyRequest, CostBasis, InstanceInfo, Instances, LineClassifier};

// Aggregation container and shard results.
pub use crate::aggregate::{AggregatedDataset, Aggregator, Amount, LineKey, Measure};
pub use crate::task::{staging_path, PartialAggregate};

// Storage, pricing, manifests.
pub use crate::store::{FetchOutcome, LocalObjectStore, ObjectStore, ObjectSummary};
pub use crate::pricing::{DiscountSchedule, DiscountSource, NoDiscount};
pub use crate::manifest::{manifest_pattern, month_of_manifest, report_name, select_manifests, substitute_debug_manifest, ManifestDescriptor};

// Decoding and ambient helpers.
pub use crate::decode::{for_each_row, DecodeStats, ShardCodec};
pub use crate::mem::{available_memory_fraction, MemoryThrottle};
pub use crate::progress::set_global_multiprogress;
pub use crate::concurrency::map_bounded;
pub use crate::util::init_tracing_once;
