//! Mergeable cost/usage aggregation.
//!
//! Every shard task fills a private `AggregatedDataset`; the month driver folds them together
//! after the join. Amounts are fixed-point integers so that `merge` is an exact commutative
//! monoid: shard completion order never changes the result.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign};

pub trait Aggregator: Send + Default {
    fn merge(&mut self, other: Self);
}

/// Fixed-point amount in billionths of a unit (dollars, hours, GB, ...).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);
    const SCALE: f64 = 1e9;

    pub const fn from_nanos(n: i64) -> Self {
        Self(n)
    }

    pub const fn nanos(self) -> i64 {
        self.0
    }

    pub fn from_f64(v: f64) -> Self {
        Self((v * Self::SCALE).round() as i64)
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / Self::SCALE
    }

    /// Parse a billing decimal such as `"0.0123"` or `"1.5E-4"`.
    /// Values that do not fit the fixed-point range are rejected.
    pub fn parse(s: &str) -> Option<Self> {
        let v: f64 = s.trim().parse().ok()?;
        let n = (v * Self::SCALE).round();
        // i64::MIN as f64 is exactly -2^63; i64::MAX as f64 rounds up to 2^63
        (n.is_finite() && n >= i64::MIN as f64 && n < i64::MAX as f64).then(|| Self(n as i64))
    }

    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    /// Scale by `factor` (e.g. `1 - discount`), rounding to the nearest nano.
    pub fn scaled(self, factor: f64) -> Self {
        Self((self.0 as f64 * factor).round() as i64)
    }

    /// Split into `parts` near-equal pieces; the remainder goes to the first piece.
    pub fn split(self, parts: usize) -> Vec<Amount> {
        let parts = parts.max(1);
        let each = self.0 / parts as i64;
        let rem = self.0 - each * parts as i64;
        let mut v = vec![Amount(each); parts];
        v[0].0 += rem;
        v
    }
}

// Plain addition saturates; `checked_add` is for callers that must notice overflow.
impl Add for Amount {
    type Output = Amount;
    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        *self = *self + rhs;
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.9}", self.as_f64())
    }
}

/// Cost and usage accumulated for one key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Measure {
    pub cost: Amount,
    pub usage: Amount,
}

impl Measure {
    pub fn new(cost: Amount, usage: Amount) -> Self {
        Self { cost, usage }
    }

    pub fn checked_add(self, rhs: Measure) -> Option<Measure> {
        Some(Measure { cost: self.cost.checked_add(rhs.cost)?, usage: self.usage.checked_add(rhs.usage)? })
    }
}

impl AddAssign for Measure {
    fn add_assign(&mut self, rhs: Measure) {
        self.cost += rhs.cost;
        self.usage += rhs.usage;
    }
}

/// Dimensions a line is aggregated under.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LineKey {
    pub account: String,
    pub region: String,
    pub product: String,
    pub operation: String,
    pub usage_type: String,
}

/// Month-wide cost/usage, hourly and monthly sections.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AggregatedDataset {
    hourly: BTreeMap<(LineKey, u32), Measure>, // (key, hour-of-month)
    monthly: BTreeMap<LineKey, Measure>,
}

impl AggregatedDataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `m` to one hour of `key`. Fails, leaving the dataset untouched, on overflow.
    pub fn add_hourly(&mut self, key: LineKey, hour: u32, m: Measure) -> Result<()> {
        let slot = self.hourly.entry((key, hour)).or_default();
        *slot = slot
            .checked_add(m)
            .ok_or_else(|| anyhow!("hourly total overflows at hour {}", hour))?;
        Ok(())
    }

    pub fn add_monthly(&mut self, key: LineKey, m: Measure) -> Result<()> {
        let slot = self.monthly.entry(key).or_default();
        *slot = slot.checked_add(m).ok_or_else(|| anyhow!("monthly total overflows"))?;
        Ok(())
    }

    pub fn hourly(&self) -> impl Iterator<Item = (&LineKey, u32, &Measure)> {
        self.hourly.iter().map(|((k, h), m)| (k, *h, m))
    }

    pub fn monthly(&self) -> impl Iterator<Item = (&LineKey, &Measure)> {
        self.monthly.iter()
    }

    pub fn hourly_get(&self, key: &LineKey, hour: u32) -> Option<&Measure> {
        self.hourly.get(&(key.clone(), hour))
    }

    pub fn monthly_get(&self, key: &LineKey) -> Option<&Measure> {
        self.monthly.get(key)
    }

    /// Sum over both sections.
    pub fn total(&self) -> Measure {
        let mut t = Measure::default();
        for m in self.hourly.values().chain(self.monthly.values()) {
            t += *m;
        }
        t
    }

    /// Highest hour index with any hourly data.
    pub fn last_hour(&self) -> Option<u32> {
        self.hourly.keys().map(|(_, h)| *h).max()
    }

    pub fn is_empty(&self) -> bool {
        self.hourly.is_empty() && self.monthly.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hourly.len() + self.monthly.len()
    }
}

impl Aggregator for AggregatedDataset {
    fn merge(&mut self, other: Self) {
        if self.is_empty() {
            *self = other;
            return;
        }
        for (k, m) in other.hourly {
            merge_measure(self.hourly.entry(k).or_default(), m);
        }
        for (k, m) in other.monthly {
            merge_measure(self.monthly.entry(k).or_default(), m);
        }
    }
}

fn merge_measure(slot: &mut Measure, m: Measure) {
    match slot.checked_add(m) {
        Some(sum) => *slot = sum,
        None => {
            tracing::warn!("aggregate overflow while merging; saturating");
            *slot += m;
        }
    }
}
