//! Temporal filtering.
//!
//! Narrows a dataset to the rows whose timestamp lies within a tolerance
//! (in hours) of a target time. Each dataset carries a [`TimeIndex`] that
//! keeps its rows sorted by timestamp, so a filter is two binary searches
//! rather than a full scan.

use crate::models::MeasurementDataset;
use chrono::{DateTime, Utc};

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Absolute difference between two instants, in fractional hours
pub fn hours_between(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    millis_to_hours(a.timestamp_millis().abs_diff(b.timestamp_millis()))
}

fn millis_to_hours(millis: u64) -> f64 {
    millis as f64 / MILLIS_PER_HOUR
}

/// Row order of a dataset sorted by (timestamp, row)
#[derive(Debug, Clone, Default)]
pub struct TimeIndex {
    keys: Vec<i64>,
    rows: Vec<usize>,
}

/// Contiguous range of a [`TimeIndex`] matching a temporal query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeWindow {
    pub start: usize,
    pub end: usize,
}

impl TimeWindow {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

impl TimeIndex {
    pub fn build(timestamps: impl Iterator<Item = DateTime<Utc>>) -> Self {
        let mut pairs: Vec<(i64, usize)> = timestamps
            .enumerate()
            .map(|(row, ts)| (ts.timestamp_millis(), row))
            .collect();
        pairs.sort_unstable();

        let (keys, rows) = pairs.into_iter().unzip();
        Self { keys, rows }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Locate the rows with `|timestamp - target| <= tolerance_hours`.
    ///
    /// The matching set is an interval of the sorted keys; a negative or
    /// non-finite tolerance matches nothing.
    pub fn window(&self, target: DateTime<Utc>, tolerance_hours: f64) -> TimeWindow {
        if !(tolerance_hours.is_finite() && tolerance_hours >= 0.0) {
            return TimeWindow { start: 0, end: 0 };
        }

        let t = target.timestamp_millis();
        let start = self
            .keys
            .partition_point(|&k| k < t && millis_to_hours(t.abs_diff(k)) > tolerance_hours);
        let end = self
            .keys
            .partition_point(|&k| k <= t || millis_to_hours(k.abs_diff(t)) <= tolerance_hours);

        TimeWindow {
            start,
            end: end.max(start),
        }
    }

    /// Dataset rows inside `window`, in time order
    pub fn rows(&self, window: TimeWindow) -> &[usize] {
        &self.rows[window.start..window.end]
    }
}

/// Rows of `dataset` within `tolerance_hours` of `target`, in original row order.
///
/// Returns an empty vector, never an error, when nothing qualifies.
pub fn filter_rows(
    dataset: &MeasurementDataset,
    target: DateTime<Utc>,
    tolerance_hours: f64,
) -> Vec<usize> {
    let index = dataset.time_index();
    let window = index.window(target, tolerance_hours);
    let mut rows = index.rows(window).to_vec();
    rows.sort_unstable();
    rows
}
