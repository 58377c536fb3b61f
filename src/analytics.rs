// Time-bucketed aggregation and period-over-period change for the admin dashboard

use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use std::ops::AddAssign;
use std::sync::Arc;

use crate::error::CatalogError;

// Source of "now" for services; swapped out in tests
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

// Anything that carries a creation instant can be bucketed by month
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

impl Timestamped for DateTime<Utc> {
    fn timestamp(&self) -> DateTime<Utc> {
        *self
    }
}

// Inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant <= self.end
    }
}

/// A rolling window of calendar months ending with the month of `reference`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    months: usize,
    reference: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(months: usize, reference: DateTime<Utc>) -> Result<Self, CatalogError> {
        if months == 0 || months > 12 {
            return Err(CatalogError::Validation(format!(
                "window length must be between 1 and 12 months, got {}",
                months
            )));
        }
        Ok(Self { months, reference })
    }

    pub fn six_months(reference: DateTime<Utc>) -> Self {
        Self {
            months: 6,
            reference,
        }
    }

    pub fn twelve_months(reference: DateTime<Utc>) -> Self {
        Self {
            months: 12,
            reference,
        }
    }

    pub fn months(&self) -> usize {
        self.months
    }

    pub fn reference(&self) -> DateTime<Utc> {
        self.reference
    }

    /// Absolute range covered by the window: from the first instant of the
    /// oldest month up to the reference instant. Records must be scoped to
    /// this range before bucketing.
    pub fn range(&self) -> DateRange {
        let this_month = month_start(self.reference);
        let start = this_month
            .checked_sub_months(Months::new(self.months as u32 - 1))
            .unwrap_or(this_month);
        DateRange::new(start, self.reference)
    }
}

pub fn month_start(instant: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(instant.year(), instant.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(instant)
}

// [first instant of this month, now]
pub fn this_month(now: DateTime<Utc>) -> DateRange {
    DateRange::new(month_start(now), now)
}

// Whole previous calendar month, ending one millisecond before this month starts
pub fn last_month(now: DateTime<Utc>) -> DateRange {
    let this_start = month_start(now);
    let start = this_start
        .checked_sub_months(Months::new(1))
        .unwrap_or(this_start);
    DateRange::new(start, this_start - chrono::Duration::milliseconds(1))
}

/// Accumulates `value(record)` into one slot per month of the window.
///
/// Slot 0 is the oldest month and the last slot is the reference month.
/// Only the month of the year is compared, not the absolute month: a record
/// from the reference month of any year lands in the last slot. Callers
/// pre-scope `records` to [`TimeWindow::range`].
pub fn bucket_months<R, V, F>(window: &TimeWindow, records: &[R], value: F) -> Vec<V>
where
    R: Timestamped,
    V: Default + Clone + AddAssign,
    F: Fn(&R) -> V,
{
    let length = window.months;
    let reference_month = window.reference.month0() as usize;
    let mut buckets = vec![V::default(); length];

    for record in records {
        let record_month = record.timestamp().month0() as usize;
        let month_diff = (reference_month + 12 - record_month) % 12;
        if month_diff < length {
            buckets[length - month_diff - 1] += value(record);
        }
    }

    buckets
}

pub fn count_by_month<R: Timestamped>(window: &TimeWindow, records: &[R]) -> Vec<u64> {
    bucket_months(window, records, |_| 1u64)
}

pub fn sum_by_month<R, F>(window: &TimeWindow, records: &[R], property: F) -> Vec<f64>
where
    R: Timestamped,
    F: Fn(&R) -> f64,
{
    bucket_months(window, records, property)
}

/// Relative change between two period totals, in percent, rounded to one
/// decimal place. Growth from a zero base reports `current * 100`.
pub fn percent_change(current: f64, previous: f64) -> f64 {
    if previous == 0.0 {
        return current * 100.0;
    }
    let percent = (current - previous) / previous * 100.0;
    (percent * 10.0).round() / 10.0
}

// Share of `count` in `total` as a whole percentage
pub fn category_share(count: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    ((count as f64 / total as f64) * 100.0).round() as u64
}
