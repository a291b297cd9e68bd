//! Line classification collaborator.
//!
//! The processor only needs two answers per row: its bill type, and what the row did to the
//! dataset (`LineOutcome`). `BasicLineClassifier` is a plain Cost and Usage implementation;
//! richer reservation/savings-plan handling plugs in through the same trait.

use crate::aggregate::{AggregatedDataset, Amount, LineKey, Measure};
use crate::config::ProcessorOptions;
use crate::date::{parse_instant_millis, MonthKey};
use crate::row::{BillType, LineOutcome, LineSpan, RawRow};
use ahash::RandomState;
use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

const HOUR_MS: i64 = 3_600_000;

pub mod columns {
    pub const BILL_TYPE: &str = "bill/BillType";
    pub const LINE_ITEM_TYPE: &str = "lineItem/LineItemType";
    pub const USAGE_ACCOUNT: &str = "lineItem/UsageAccountId";
    pub const PRODUCT_NAME: &str = "product/ProductName";
    pub const PRODUCT_CODE: &str = "lineItem/ProductCode";
    pub const OPERATION: &str = "lineItem/Operation";
    pub const USAGE_TYPE: &str = "lineItem/UsageType";
    pub const USAGE_START: &str = "lineItem/UsageStartDate";
    pub const USAGE_END: &str = "lineItem/UsageEndDate";
    pub const USAGE_AMOUNT: &str = "lineItem/UsageAmount";
    pub const UNBLENDED_COST: &str = "lineItem/UnblendedCost";
    pub const BLENDED_COST: &str = "lineItem/BlendedCost";
    pub const NET_UNBLENDED_COST: &str = "lineItem/NetUnblendedCost";
    pub const RESOURCE_ID: &str = "lineItem/ResourceId";
    pub const REGION: &str = "product/region";
}

/// Per-call parameters, identical for every row of one month (except `is_replay`).
#[derive(Clone, Debug)]
pub struct ClassifyRequest<'a> {
    pub month_start_millis: i64,
    pub is_replay: bool,
    pub root_name: &'a str,
    pub include_retroactive: bool,
    pub discount: f64,
}

/// Resource registry shared by all shards of a month. Internally synchronized because the
/// classifier writes to it from every worker.
#[derive(Debug, Default)]
pub struct Instances {
    inner: Mutex<HashMap<String, InstanceInfo, RandomState>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceInfo {
    pub account: String,
    pub region: String,
    pub product: String,
    pub last_seen_millis: i64,
}

impl Instances {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or refresh) a resource; keeps the latest sighting.
    pub fn observe(&self, resource_id: &str, info: InstanceInfo) {
        let mut map = self.inner.lock();
        match map.get_mut(resource_id) {
            Some(prev) if prev.last_seen_millis >= info.last_seen_millis => {}
            Some(prev) => *prev = info,
            None => {
                map.insert(resource_id.to_string(), info);
            }
        }
    }

    pub fn get(&self, resource_id: &str) -> Option<InstanceInfo> {
        self.inner.lock().get(resource_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

pub trait LineClassifier: Send + Sync {
    fn bill_type(&self, row: &RawRow) -> BillType;

    /// Classify `row` and apply it to `dataset`. An `Err` is a row-level failure: the caller
    /// logs it and moves on.
    fn classify(
        &self,
        req: &ClassifyRequest<'_>,
        row: &RawRow,
        dataset: &mut AggregatedDataset,
        instances: &Instances,
    ) -> Result<LineOutcome>;
}

/// Which cost column to read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CostBasis {
    #[default]
    Unblended,
    Blended,
}

#[derive(Clone, Debug, Default)]
pub struct BasicLineClassifier {
    basis: CostBasis,
    net_unblended_start: Option<MonthKey>,
}

impl BasicLineClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cost column selection as configured on the processor.
    pub fn from_options(opts: &ProcessorOptions) -> Self {
        let basis = if opts.use_blended { CostBasis::Blended } else { CostBasis::Unblended };
        Self::new().with_basis(basis).with_net_unblended_start(opts.net_unblended_start)
    }

    pub fn with_basis(mut self, basis: CostBasis) -> Self {
        self.basis = basis;
        self
    }

    /// From this month on, prefer `lineItem/NetUnblendedCost` when the shard has it.
    pub fn with_net_unblended_start(mut self, start: Option<MonthKey>) -> Self {
        self.net_unblended_start = start;
        self
    }

    fn cost(&self, req: &ClassifyRequest<'_>, row: &RawRow) -> Result<Amount> {
        let column = match self.basis {
            CostBasis::Blended => columns::BLENDED_COST,
            CostBasis::Unblended => {
                let net = self.net_unblended_start.map_or(false, |start| {
                    MonthKey::from_epoch_millis(req.month_start_millis).map_or(false, |m| m >= start)
                });
                if net && row.header().contains(columns::NET_UNBLENDED_COST) {
                    columns::NET_UNBLENDED_COST
                } else {
                    columns::UNBLENDED_COST
                }
            }
        };
        let raw = row.get_nonempty(column).unwrap_or("0");
        let cost = Amount::parse(raw).ok_or_else(|| anyhow!("bad {} value {:?}", column, raw))?;
        Ok(cost.scaled(1.0 - req.discount))
    }

    fn usage(&self, row: &RawRow) -> Result<Amount> {
        let raw = row.get_nonempty(columns::USAGE_AMOUNT).unwrap_or("0");
        Amount::parse(raw).ok_or_else(|| anyhow!("bad {} value {:?}", columns::USAGE_AMOUNT, raw))
    }

    fn span(&self, row: &RawRow) -> Result<Option<LineSpan>> {
        let (start, end) = match (row.get_nonempty(columns::USAGE_START), row.get_nonempty(columns::USAGE_END)) {
            (Some(s), Some(e)) => (s, e),
            _ => return Ok(None),
        };
        let start_millis = parse_instant_millis(start).ok_or_else(|| anyhow!("bad usage start {:?}", start))?;
        let end_millis = parse_instant_millis(end).ok_or_else(|| anyhow!("bad usage end {:?}", end))?;
        if end_millis < start_millis {
            bail!("usage end {} precedes start {}", end, start);
        }
        Ok(Some(LineSpan { start_millis, end_millis }))
    }

    fn key(&self, row: &RawRow) -> LineKey {
        let text = |c: &str| row.get_nonempty(c).unwrap_or("").to_string();
        let product = row
            .get_nonempty(columns::PRODUCT_NAME)
            .or_else(|| row.get_nonempty(columns::PRODUCT_CODE))
            .unwrap_or("")
            .to_string();
        LineKey {
            account: text(columns::USAGE_ACCOUNT),
            region: text(columns::REGION),
            product,
            operation: text(columns::OPERATION),
            usage_type: text(columns::USAGE_TYPE),
        }
    }
}

/// First instant after the month that starts at `month_start_millis`.
fn month_end_millis(month_start_millis: i64) -> i64 {
    MonthKey::from_epoch_millis(month_start_millis)
        .and_then(MonthKey::next)
        .map_or(i64::MAX, MonthKey::start_millis)
}

fn hour_index(month_start_millis: i64, instant_millis: i64) -> u32 {
    ((instant_millis - month_start_millis).max(0) / HOUR_MS) as u32
}

impl LineClassifier for BasicLineClassifier {
    fn bill_type(&self, row: &RawRow) -> BillType {
        row.get(columns::BILL_TYPE).map(BillType::parse).unwrap_or(BillType::Unknown)
    }

    fn classify(
        &self,
        req: &ClassifyRequest<'_>,
        row: &RawRow,
        dataset: &mut AggregatedDataset,
        instances: &Instances,
    ) -> Result<LineOutcome> {
        let line_type = row.get_nonempty(columns::LINE_ITEM_TYPE).unwrap_or("");
        let is_fee = matches!(line_type, "RIFee" | "SavingsPlanRecurringFee");
        let is_usage = matches!(line_type, "Usage" | "DiscountedUsage" | "SavingsPlanCoveredUsage");

        // Fees are spread across their whole span, which needs the month's usage first.
        if is_fee && !req.is_replay {
            return Ok(LineOutcome::Delay);
        }

        let span = self.span(row)?;
        let month_end = month_end_millis(req.month_start_millis);
        let key = self.key(row);
        let measure = Measure::new(self.cost(req, row)?, self.usage(row)?);

        let span = match span {
            Some(s) if s.start_millis < req.month_start_millis => {
                if !req.include_retroactive {
                    return Ok(LineOutcome::Skip);
                }
                dataset.add_monthly(key, measure)?;
                return Ok(LineOutcome::Other);
            }
            Some(s) if (is_fee || is_usage) && s.start_millis < month_end => LineSpan {
                start_millis: s.start_millis,
                end_millis: s.end_millis.min(month_end),
            },
            _ => {
                dataset.add_monthly(key, measure)?;
                return Ok(LineOutcome::Other);
            }
        };

        let first = hour_index(req.month_start_millis, span.start_millis);
        if is_fee {
            // spread over the part of the span inside this month
            let hours = ((span.end_millis - span.start_millis + HOUR_MS - 1) / HOUR_MS).max(1) as usize;
            let costs = measure.cost.split(hours);
            let usages = measure.usage.split(hours);
            for (i, (c, u)) in costs.into_iter().zip(usages).enumerate() {
                dataset.add_hourly(key.clone(), first + i as u32, Measure::new(c, u))?;
            }
        } else {
            dataset.add_hourly(key.clone(), first, measure)?;
            if let Some(resource) = row.get_nonempty(columns::RESOURCE_ID) {
                instances.observe(
                    resource,
                    InstanceInfo {
                        account: key.account,
                        region: key.region,
                        product: key.product,
                        last_seen_millis: span.end_millis,
                    },
                );
            }
        }
        tracing::trace!("{} line in {} classified hourly", line_type, req.root_name);
        Ok(LineOutcome::Hourly { span })
    }
}
