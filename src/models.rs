//! Core data structures for observation fusion.
//!
//! Defines measurement records and datasets, the fused output table,
//! feature groups and the statistics collected while fusing.

use crate::error::{FusionError, Result};
use crate::temporal::TimeIndex;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Auxiliary source families. A fused row needs every configured family
/// to contribute at least one feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureGroup {
    Satellite,
    Weather,
}

impl fmt::Display for FeatureGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureGroup::Satellite => write!(f, "satellite"),
            FeatureGroup::Weather => write!(f, "weather"),
        }
    }
}

/// Returns true when the coordinate pair is finite and inside
/// [-90, 90] x [-180, 180].
pub fn valid_coordinates(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}

/// A single observation: where, when, and the named values measured there.
///
/// `values` is aligned with the owning dataset's `value_columns`.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub values: Vec<Option<f64>>,
    pub place_name: Option<String>,
}

impl Observation {
    pub fn new(
        timestamp: DateTime<Utc>,
        latitude: f64,
        longitude: f64,
        values: Vec<Option<f64>>,
    ) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
            values,
            place_name: None,
        }
    }

    pub fn with_place_name(mut self, place_name: impl Into<String>) -> Self {
        self.place_name = Some(place_name.into());
        self
    }

    pub fn has_valid_coordinates(&self) -> bool {
        valid_coordinates(self.latitude, self.longitude)
    }
}

/// An ordered, immutable set of observations from one source.
///
/// Rows with out-of-range coordinates are excluded at construction, so
/// every row held here can be indexed spatially. A time-sorted index is
/// built once and shared by every temporal query against the dataset.
#[derive(Debug, Clone)]
pub struct MeasurementDataset {
    name: String,
    value_columns: Vec<String>,
    observations: Vec<Observation>,
    time_index: TimeIndex,
    excluded_rows: usize,
}

impl MeasurementDataset {
    pub fn new(
        name: impl Into<String>,
        value_columns: Vec<String>,
        observations: Vec<Observation>,
    ) -> Result<Self> {
        let name = name.into();

        if let Some(bad) = observations
            .iter()
            .find(|obs| obs.values.len() != value_columns.len())
        {
            return Err(FusionError::configuration(format!(
                "dataset '{}' declares {} value columns but a row carries {}",
                name,
                value_columns.len(),
                bad.values.len()
            )));
        }

        let total = observations.len();
        let observations: Vec<Observation> = observations
            .into_iter()
            .filter(Observation::has_valid_coordinates)
            .collect();
        let excluded_rows = total - observations.len();

        let time_index = TimeIndex::build(observations.iter().map(|obs| obs.timestamp));

        Ok(Self {
            name,
            value_columns,
            observations,
            time_index,
            excluded_rows,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value_columns(&self) -> &[String] {
        &self.value_columns
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Rows dropped at construction because of invalid coordinates
    pub fn excluded_rows(&self) -> usize {
        self.excluded_rows
    }

    pub fn time_index(&self) -> &TimeIndex {
        &self.time_index
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.value_columns.iter().position(|c| c == column)
    }

    /// Value of `column` at `row`; `None` for empty cells, NaN, or unknown columns
    pub fn value(&self, row: usize, column: usize) -> Option<f64> {
        self.observations
            .get(row)?
            .values
            .get(column)
            .copied()
            .flatten()
            .filter(|v| !v.is_nan())
    }
}

/// One row of the fused output table.
///
/// `features` is aligned with [`FusedTable::feature_columns`]; `None`
/// marks a feature that could not be resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedRecord {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub place_name: Option<String>,
    pub primary: f64,
    pub co_pollutant: f64,
    pub composite_index: f64,
    pub features: Vec<Option<f64>>,
}

/// Fixed leading columns of the fused table
pub const TIMESTAMP_COLUMN: &str = "timestamp";
pub const LATITUDE_COLUMN: &str = "latitude";
pub const LONGITUDE_COLUMN: &str = "longitude";
pub const PLACE_NAME_COLUMN: &str = "place_name";

/// Column names no target or feature may take
pub const RESERVED_COLUMNS: [&str; 4] = [
    TIMESTAMP_COLUMN,
    LATITUDE_COLUMN,
    LONGITUDE_COLUMN,
    PLACE_NAME_COLUMN,
];

/// Names of the three target columns of the fused table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetNames {
    pub primary: String,
    pub co_pollutant: String,
    pub composite_index: String,
}

impl TargetNames {
    pub fn all(&self) -> [&str; 3] {
        [
            self.primary.as_str(),
            self.co_pollutant.as_str(),
            self.composite_index.as_str(),
        ]
    }
}

impl Default for TargetNames {
    fn default() -> Self {
        Self {
            primary: "pm25".to_string(),
            co_pollutant: "o3".to_string(),
            composite_index: "aqi".to_string(),
        }
    }
}

/// The fused table: one record per retained ground-truth observation.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedTable {
    pub targets: TargetNames,
    pub feature_columns: Vec<String>,
    pub records: Vec<FusedRecord>,
}

impl FusedTable {
    pub fn new(targets: TargetNames, feature_columns: Vec<String>) -> Self {
        Self {
            targets,
            feature_columns,
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Numeric column by name: a target or a fused feature
    pub fn numeric_column(&self, name: &str) -> Option<Vec<Option<f64>>> {
        if name == self.targets.primary {
            return Some(self.records.iter().map(|r| Some(r.primary)).collect());
        }
        if name == self.targets.co_pollutant {
            return Some(self.records.iter().map(|r| Some(r.co_pollutant)).collect());
        }
        if name == self.targets.composite_index {
            return Some(
                self.records
                    .iter()
                    .map(|r| Some(r.composite_index))
                    .collect(),
            );
        }

        let position = self.feature_columns.iter().position(|c| c == name)?;
        Some(
            self.records
                .iter()
                .map(|r| r.features.get(position).copied().flatten())
                .collect(),
        )
    }
}

/// How the fusion driver actually ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Parallel,
    Sequential,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Parallel => write!(f, "parallel"),
            ExecutionMode::Sequential => write!(f, "sequential"),
        }
    }
}

/// Fusion statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FusionStats {
    pub ground_truth_rows: usize,
    pub fused_rows: usize,
    pub dropped_missing_co_pollutant: usize,
    /// Ground-truth rows whose own value was empty or NaN
    pub dropped_missing_primary: usize,
    pub dropped_incomplete: usize,
    pub chunks: usize,
    pub mode: ExecutionMode,
}

impl FusionStats {
    /// Fold a chunk's counters into the running totals
    pub fn absorb(&mut self, other: &FusionStats) {
        self.ground_truth_rows += other.ground_truth_rows;
        self.fused_rows += other.fused_rows;
        self.dropped_missing_co_pollutant += other.dropped_missing_co_pollutant;
        self.dropped_missing_primary += other.dropped_missing_primary;
        self.dropped_incomplete += other.dropped_incomplete;
    }

    pub fn dropped_rows(&self) -> usize {
        self.dropped_missing_co_pollutant + self.dropped_missing_primary + self.dropped_incomplete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_valid_coordinates_bounds() {
        assert!(valid_coordinates(90.0, 180.0));
        assert!(valid_coordinates(-90.0, -180.0));
        assert!(!valid_coordinates(90.5, 0.0));
        assert!(!valid_coordinates(0.0, -180.1));
        assert!(!valid_coordinates(f64::NAN, 0.0));
        assert!(!valid_coordinates(0.0, f64::INFINITY));
    }

    #[test]
    fn test_dataset_excludes_invalid_coordinates() {
        let rows = vec![
            Observation::new(at(1), 40.0, -74.0, vec![Some(1.0)]),
            Observation::new(at(2), 95.0, -74.0, vec![Some(2.0)]),
            Observation::new(at(3), 40.0, f64::NAN, vec![Some(3.0)]),
        ];

        let dataset = MeasurementDataset::new("no2", vec!["no2".to_string()], rows).unwrap();

        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.excluded_rows(), 2);
        assert_eq!(dataset.value(0, 0), Some(1.0));
    }

    #[test]
    fn test_dataset_rejects_misaligned_values() {
        let rows = vec![Observation::new(at(1), 40.0, -74.0, vec![Some(1.0), None])];

        let result = MeasurementDataset::new("no2", vec!["no2".to_string()], rows);

        assert!(matches!(result, Err(FusionError::Configuration { .. })));
    }

    #[test]
    fn test_value_treats_nan_as_missing() {
        let rows = vec![Observation::new(at(1), 40.0, -74.0, vec![Some(f64::NAN), None])];
        let dataset =
            MeasurementDataset::new("wind", vec!["u".to_string(), "v".to_string()], rows).unwrap();

        assert_eq!(dataset.value(0, 0), None);
        assert_eq!(dataset.value(0, 1), None);
        assert_eq!(dataset.value(0, 2), None);
        assert_eq!(dataset.column_index("v"), Some(1));
    }

    #[test]
    fn test_numeric_column_lookup() {
        let mut table = FusedTable::new(TargetNames::default(), vec!["tempo_no2".to_string()]);
        table.records.push(FusedRecord {
            timestamp: at(12),
            latitude: 40.0,
            longitude: -74.0,
            place_name: None,
            primary: 10.0,
            co_pollutant: 60.0,
            composite_index: 41.6,
            features: vec![None],
        });

        assert_eq!(table.numeric_column("pm25"), Some(vec![Some(10.0)]));
        assert_eq!(table.numeric_column("tempo_no2"), Some(vec![None]));
        assert_eq!(table.numeric_column("missing"), None);
    }

    #[test]
    fn test_stats_absorb() {
        let mut total = FusionStats::default();
        let chunk = FusionStats {
            ground_truth_rows: 5,
            fused_rows: 3,
            dropped_missing_co_pollutant: 1,
            dropped_incomplete: 1,
            ..Default::default()
        };

        total.absorb(&chunk);
        total.absorb(&chunk);

        assert_eq!(total.ground_truth_rows, 10);
        assert_eq!(total.fused_rows, 6);
        assert_eq!(total.dropped_rows(), 4);
    }
}
