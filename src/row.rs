//! Parsed billing rows: the shard's column layout, the row snapshot handed to the classifier,
//! and the classification vocabulary.

use ahash::RandomState;
use csv::StringRecord;
use std::collections::HashMap;
use std::sync::Arc;

/// Column layout of one CSV stream (its first record), shared by every row of that stream.
#[derive(Debug, Default)]
pub struct Header {
    names: Vec<String>,
    index: HashMap<String, usize, RandomState>,
}

impl Header {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let mut index = HashMap::with_capacity_and_hasher(names.len(), RandomState::new());
        for (i, n) in names.iter().enumerate() {
            // first occurrence wins on duplicated column names
            index.entry(n.trim().to_string()).or_insert(i);
        }
        Self { names, index }
    }

    pub fn from_record(rec: &StringRecord) -> Self {
        Self::new(rec.iter())
    }

    #[inline]
    pub fn position(&self, column: &str) -> Option<usize> {
        self.index.get(column).copied()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.index.contains_key(column)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Immutable snapshot of one parsed line plus its stream's header layout.
/// Cheap to keep around for deferred replay; never aliases reader state.
#[derive(Clone, Debug)]
pub struct RawRow {
    header: Arc<Header>,
    fields: StringRecord,
}

impl RawRow {
    pub fn new(header: Arc<Header>, fields: StringRecord) -> Self {
        Self { header, fields }
    }

    /// Build a row from plain values; handy for feeding rows that did not come from a shard.
    pub fn from_values<I, S>(header: Arc<Header>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rec = StringRecord::new();
        for v in values {
            rec.push_field(v.as_ref());
        }
        Self { header, fields: rec }
    }

    /// Field value by column name; `None` if the column is absent or the row is short.
    #[inline]
    pub fn get(&self, column: &str) -> Option<&str> {
        self.header.position(column).and_then(|i| self.fields.get(i))
    }

    /// Field value by column name, trimmed; empty values count as absent.
    pub fn get_nonempty(&self, column: &str) -> Option<&str> {
        self.get(column).map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn header(&self) -> &Arc<Header> {
        &self.header
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Comma-joined fields, for log lines about rejected rows.
    pub fn joined(&self) -> String {
        self.fields.iter().collect::<Vec<_>>().join(",")
    }
}

/// Billing type of a line (`bill/BillType`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BillType {
    Anniversary,
    Purchase,
    Refund,
    Unknown,
}

impl BillType {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "Anniversary" => BillType::Anniversary,
            "Purchase" => BillType::Purchase,
            "Refund" => BillType::Refund,
            _ => BillType::Unknown,
        }
    }

    /// Purchases and refunds are not billable usage and never enter the dataset.
    pub fn is_excluded(self) -> bool {
        matches!(self, BillType::Purchase | BillType::Refund)
    }
}

/// Time span of a resolved line, epoch millis (end exclusive).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineSpan {
    pub start_millis: i64,
    pub end_millis: i64,
}

/// What the classifier decided for one row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineOutcome {
    /// Not relevant; nothing recorded.
    Skip,
    /// Needs month-wide context; replay after all shards have joined.
    Delay,
    /// Recorded against hourly data; `span.end_millis` may advance the watermark.
    Hourly { span: LineSpan },
    /// Recorded, but not hourly (monthly totals, taxes, credits, retroactive lines).
    Other,
}
