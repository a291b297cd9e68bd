//! Month-scoped discount lookup (enterprise discount programs and the like).

use crate::date::MonthKey;
use std::collections::BTreeMap;

pub trait DiscountSource: Send + Sync {
    /// Discount fraction in `[0, 1)` effective at `epoch_millis`.
    fn discount_for(&self, epoch_millis: i64) -> f64;
}

/// No discount at any time.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDiscount;

impl DiscountSource for NoDiscount {
    fn discount_for(&self, _epoch_millis: i64) -> f64 {
        0.0
    }
}

/// Step function over months: each entry applies from its month until the next entry.
#[derive(Clone, Debug, Default)]
pub struct DiscountSchedule {
    steps: BTreeMap<MonthKey, f64>,
}

impl DiscountSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step; fractions outside `[0, 1)` are clamped.
    pub fn with_step(mut self, from: MonthKey, fraction: f64) -> Self {
        let clamped = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 0.999_999) };
        if clamped != fraction {
            tracing::warn!("discount {} from {} is outside [0,1); using {}", fraction, from, clamped);
        }
        self.steps.insert(from, clamped);
        self
    }

    pub fn for_month(&self, month: MonthKey) -> f64 {
        self.steps.range(..=month).next_back().map(|(_, f)| *f).unwrap_or(0.0)
    }
}

impl DiscountSource for DiscountSchedule {
    fn discount_for(&self, epoch_millis: i64) -> f64 {
        MonthKey::from_epoch_millis(epoch_millis).map(|m| self.for_month(m)).unwrap_or(0.0)
    }
}
