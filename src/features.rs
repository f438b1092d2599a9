//! Feature/target preparation.
//!
//! Derives calendar features from each fused record's timestamp, selects
//! the configured feature and target columns, and fills numeric gaps with
//! the median of the non-missing values in the same table.

use crate::config::FusionConfig;
use crate::error::{FusionError, Result};
use crate::models::FusedTable;
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use ndarray::{Array1, Array2, ArrayView1};
use tracing::{debug, warn};

pub const HOUR: &str = "hour";
pub const DAY_OF_YEAR: &str = "day_of_year";
pub const IS_WEEKEND: &str = "is_weekend";

/// Calendar features derived from the timestamp rather than a data source
pub const CALENDAR_FEATURES: [&str; 3] = [HOUR, DAY_OF_YEAR, IS_WEEKEND];

/// Hour of day (0-23), day of year (1-366) and weekend flag (Saturday or
/// Sunday) for a UTC timestamp
pub fn calendar_features(timestamp: DateTime<Utc>) -> [f64; 3] {
    let weekend = matches!(timestamp.weekday(), Weekday::Sat | Weekday::Sun);
    [
        f64::from(timestamp.hour()),
        f64::from(timestamp.ordinal()),
        if weekend { 1.0 } else { 0.0 },
    ]
}

fn calendar_value(name: &str, timestamp: DateTime<Utc>) -> Option<f64> {
    let position = CALENDAR_FEATURES.iter().position(|c| *c == name)?;
    Some(calendar_features(timestamp)[position])
}

/// Median of `values`; the mean of the two middle values for even counts
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// A gap-filling applied to one column
#[derive(Debug, Clone, PartialEq)]
pub struct Imputation {
    pub column: String,
    pub fill_value: f64,
    pub filled: usize,
}

/// Replace every missing (or NaN) entry with the median of the known ones.
///
/// An entirely missing column is filled with 0.0.
pub fn impute_median(column: &str, values: &[Option<f64>]) -> (Vec<f64>, Imputation) {
    let known: Vec<f64> = values
        .iter()
        .filter_map(|v| v.filter(|x| !x.is_nan()))
        .collect();
    let filled = values.len() - known.len();

    let fill_value = median(&known).unwrap_or_else(|| {
        if !values.is_empty() {
            warn!("Column '{}' has no known values, filling with 0.0", column);
        }
        0.0
    });

    let completed = values
        .iter()
        .map(|v| v.filter(|x| !x.is_nan()).unwrap_or(fill_value))
        .collect();

    (
        completed,
        Imputation {
            column: column.to_string(),
            fill_value,
            filled,
        },
    )
}

/// Named columns over a dense row-major matrix
#[derive(Debug, Clone, PartialEq)]
pub struct DesignMatrix {
    pub columns: Vec<String>,
    pub values: Array2<f64>,
}

impl DesignMatrix {
    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        let position = self.columns.iter().position(|c| c == name)?;
        Some(self.values.column(position))
    }
}

/// Feature and target matrices ready for model fitting
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedData {
    pub timestamps: Vec<DateTime<Utc>>,
    pub features: DesignMatrix,
    pub targets: DesignMatrix,
    pub imputations: Vec<Imputation>,
}

impl PreparedData {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Selects feature and target columns from a fused table
#[derive(Debug, Clone)]
pub struct FeaturePreparer {
    feature_columns: Vec<String>,
    target_columns: Vec<String>,
}

impl FeaturePreparer {
    pub fn new(feature_columns: Vec<String>, target_columns: Vec<String>) -> Self {
        Self {
            feature_columns,
            target_columns,
        }
    }

    pub fn from_config(config: &FusionConfig) -> Self {
        Self::new(config.feature_columns.clone(), config.target_columns.clone())
    }

    pub fn feature_columns(&self) -> &[String] {
        &self.feature_columns
    }

    pub fn target_columns(&self) -> &[String] {
        &self.target_columns
    }

    /// Build imputed feature and target matrices from `table`.
    ///
    /// Fails when a selected column is neither a calendar feature, a target
    /// nor a fused feature of the table.
    pub fn prepare(&self, table: &FusedTable) -> Result<PreparedData> {
        let timestamps: Vec<DateTime<Utc>> = table.records.iter().map(|r| r.timestamp).collect();
        let mut imputations = Vec::new();

        let features = self.matrix(table, &timestamps, &self.feature_columns, &mut imputations)?;
        let targets = self.matrix(table, &timestamps, &self.target_columns, &mut imputations)?;

        let filled: usize = imputations.iter().map(|i| i.filled).sum();
        debug!(
            "Prepared {} rows x {} features, {} targets ({} values imputed)",
            timestamps.len(),
            features.ncols(),
            targets.ncols(),
            filled
        );

        Ok(PreparedData {
            timestamps,
            features,
            targets,
            imputations,
        })
    }

    fn matrix(
        &self,
        table: &FusedTable,
        timestamps: &[DateTime<Utc>],
        columns: &[String],
        imputations: &mut Vec<Imputation>,
    ) -> Result<DesignMatrix> {
        let mut values = Array2::zeros((timestamps.len(), columns.len()));

        for (j, name) in columns.iter().enumerate() {
            let raw: Vec<Option<f64>> = if CALENDAR_FEATURES.iter().any(|c| name == *c) {
                timestamps
                    .iter()
                    .map(|ts| calendar_value(name, *ts))
                    .collect()
            } else {
                table.numeric_column(name).ok_or_else(|| {
                    FusionError::configuration(format!(
                        "column '{}' is not present in the fused table",
                        name
                    ))
                })?
            };

            let (completed, imputation) = impute_median(name, &raw);
            if imputation.filled > 0 {
                debug!(
                    "Imputed {} missing '{}' values with median {}",
                    imputation.filled, name, imputation.fill_value
                );
                imputations.push(imputation);
            }
            values.column_mut(j).assign(&Array1::from(completed));
        }

        Ok(DesignMatrix {
            columns: columns.to_vec(),
            values,
        })
    }
}
