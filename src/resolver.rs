//! Nearest-measurement resolution.
//!
//! Combines the temporal filter with a spatial index built over the rows
//! that survive it. Ground-truth rows typically share timestamps, so the
//! index for a given (source, time window) is cached and reused by the
//! owning worker. Caches are keyed by the caller's source position, not by
//! dataset name, and are never shared between workers.

use crate::config::{SpatialPolicy, ValueSelection};
use crate::models::MeasurementDataset;
use crate::spatial::SpatialIndex;
use crate::temporal::TimeWindow;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::trace;

/// Where and when to look
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchQuery {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
}

/// Per-source search limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub time_hours: f64,
    pub spatial: f64,
}

/// Values read from the matched row
#[derive(Debug, Clone, PartialEq)]
pub enum MatchedValues {
    Single(Option<f64>),
    Many(Vec<(String, Option<f64>)>),
}

/// A successful match
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub row: usize,
    pub distance: f64,
    /// Whether the match lies inside the spatial tolerance
    pub within_tolerance: bool,
    pub values: MatchedValues,
}

/// Resolves nearest measurements for one worker.
#[derive(Debug)]
pub struct NearestResolver {
    policy: SpatialPolicy,
    capacity: usize,
    cache: HashMap<usize, HashMap<TimeWindow, SpatialIndex>>,
    builds: usize,
}

impl NearestResolver {
    pub fn new(policy: SpatialPolicy, capacity: usize) -> Self {
        Self {
            policy,
            capacity: capacity.max(1),
            cache: HashMap::new(),
            builds: 0,
        }
    }

    /// Spatial indices built so far (cache misses)
    pub fn index_builds(&self) -> usize {
        self.builds
    }

    /// Find the closest row of `dataset` within the time tolerance.
    ///
    /// `source` identifies the dataset in the cache; callers must pass the
    /// same dataset for the same `source` every time.
    ///
    /// `None` when no row falls inside the time window, or, under
    /// [`SpatialPolicy::WithinTolerance`], when the closest row is further
    /// than the spatial tolerance.
    pub fn resolve(
        &mut self,
        source: usize,
        dataset: &MeasurementDataset,
        query: &MatchQuery,
        tolerance: Tolerance,
        selection: &ValueSelection,
    ) -> Option<Resolution> {
        let time_index = dataset.time_index();
        let window = time_index.window(query.timestamp, tolerance.time_hours);
        if window.is_empty() {
            trace!(
                "{}: no rows within {}h of {}",
                dataset.name(),
                tolerance.time_hours,
                query.timestamp
            );
            return None;
        }

        let neighbor = {
            let index = self.index_for(source, dataset, window);
            index.nearest(query.latitude, query.longitude)?
        };

        let within_tolerance = neighbor.distance <= tolerance.spatial;
        if !within_tolerance && self.policy == SpatialPolicy::WithinTolerance {
            trace!(
                "{}: nearest row {} is {:.3}° away (tolerance {}°)",
                dataset.name(),
                neighbor.row,
                neighbor.distance,
                tolerance.spatial
            );
            return None;
        }

        Some(Resolution {
            row: neighbor.row,
            distance: neighbor.distance,
            within_tolerance,
            values: read_values(dataset, neighbor.row, selection),
        })
    }

    fn index_for(
        &mut self,
        source: usize,
        dataset: &MeasurementDataset,
        window: TimeWindow,
    ) -> &SpatialIndex {
        let capacity = self.capacity;
        let per_dataset = self.cache.entry(source).or_default();

        if !per_dataset.contains_key(&window) {
            if per_dataset.len() >= capacity {
                per_dataset.clear();
            }
            let rows = dataset.time_index().rows(window);
            per_dataset.insert(window, SpatialIndex::from_rows(dataset, rows));
            self.builds += 1;
        }

        &per_dataset[&window]
    }
}

fn read_values(dataset: &MeasurementDataset, row: usize, selection: &ValueSelection) -> MatchedValues {
    let lookup = |column: &str| {
        dataset
            .column_index(column)
            .and_then(|position| dataset.value(row, position))
    };

    match selection {
        ValueSelection::Column(column) => MatchedValues::Single(lookup(column)),
        ValueSelection::Columns(columns) => MatchedValues::Many(
            columns
                .iter()
                .map(|column| (column.clone(), lookup(column)))
                .collect(),
        ),
    }
}
