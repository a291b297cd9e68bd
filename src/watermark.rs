//! Completeness watermark: "data is accounted for up to and including this instant".

use crate::date::{format_millis, MonthKey};
use std::fmt;

/// Epoch-millisecond instant that only ever moves forward within one month's processing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(i64);

impl Watermark {
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    /// The nominal start of `month`; the floor for every shard of that month.
    pub fn month_start(month: MonthKey) -> Self {
        Self(month.start_millis())
    }

    pub const fn millis(self) -> i64 {
        self.0
    }

    /// Move forward to `ms` if it is later; never moves backward.
    #[inline]
    pub fn advance(&mut self, ms: i64) {
        if ms > self.0 {
            self.0 = ms;
        }
    }

    #[inline]
    pub fn max(self, other: Self) -> Self {
        if other.0 > self.0 { other } else { self }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_millis(self.0))
    }
}
