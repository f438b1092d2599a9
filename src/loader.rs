//! Dataset loading.
//!
//! Reads the ground-truth and auxiliary CSV files with polars and converts
//! them into [`MeasurementDataset`]s. Rows with unparseable timestamps are
//! skipped here; rows with out-of-range coordinates are excluded when the
//! dataset is built. All files are loaded before fusion starts.

use crate::config::{FusionConfig, GroundTruthConfig, SourceConfig};
use crate::error::{FusionError, Result};
use crate::models::{MeasurementDataset, Observation};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::future::try_join_all;
use polars::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::task;
use tracing::{debug, info, warn};

/// Rows sampled for CSV schema inference
const SCHEMA_INFERENCE_ROWS: usize = 1000;

const OFFSET_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
];

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Parse a timestamp as written by common tabular tools.
///
/// Accepts space or `T` separated date-times with optional fractional
/// seconds and optional UTC offset or `Z`, and bare dates. Timestamps
/// without an offset are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    let naive = s.strip_suffix('Z').unwrap_or(s);
    for format in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, format) {
            return Some(dt.and_utc());
        }
    }

    NaiveDate::parse_from_str(naive, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Which columns to read from one file
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSpec {
    pub name: String,
    pub path: PathBuf,
    pub timestamp_column: String,
    pub latitude_column: String,
    pub longitude_column: String,
    pub value_columns: Vec<String>,
    pub place_column: Option<String>,
    /// Skip rows whose first value column is empty
    pub require_value: bool,
}

impl DatasetSpec {
    fn base(config: &FusionConfig, name: &str, file: &Path) -> Self {
        Self {
            name: name.to_string(),
            path: config.resolve(file),
            timestamp_column: config.timestamp_column.clone(),
            latitude_column: config.latitude_column.clone(),
            longitude_column: config.longitude_column.clone(),
            value_columns: Vec::new(),
            place_column: None,
            require_value: false,
        }
    }

    pub fn ground_truth(config: &FusionConfig, name: &str, truth: &GroundTruthConfig) -> Self {
        Self {
            value_columns: vec![truth.value_column.clone()],
            place_column: truth.place_column.clone(),
            require_value: true,
            ..Self::base(config, name, &truth.file)
        }
    }

    pub fn source(config: &FusionConfig, source: &SourceConfig) -> Self {
        Self {
            value_columns: source
                .values
                .columns()
                .into_iter()
                .map(str::to_string)
                .collect(),
            ..Self::base(config, &source.name, &source.file)
        }
    }
}

/// Every dataset a fusion run needs
#[derive(Debug, Clone)]
pub struct LoadedDatasets {
    pub primary: MeasurementDataset,
    pub co_pollutant: MeasurementDataset,
    /// In `FusionConfig::sources` order
    pub sources: Vec<MeasurementDataset>,
}

/// Load one CSV file into a dataset
pub fn load_dataset(spec: &DatasetSpec) -> Result<MeasurementDataset> {
    if !spec.path.exists() {
        return Err(FusionError::DatasetNotFound {
            path: spec.path.clone(),
        });
    }

    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(SCHEMA_INFERENCE_ROWS))
        .try_into_reader_with_file_path(Some(spec.path.clone()))?
        .finish()?;

    let column = |name: &str| {
        df.column(name)
            .map_err(|_| FusionError::missing_column(&spec.name, name))
    };

    let timestamps = column(&spec.timestamp_column)?.cast(&DataType::String)?;
    let latitudes = column(&spec.latitude_column)?.cast(&DataType::Float64)?;
    let longitudes = column(&spec.longitude_column)?.cast(&DataType::Float64)?;
    let values = spec
        .value_columns
        .iter()
        .map(|name| Ok(column(name)?.cast(&DataType::Float64)?))
        .collect::<Result<Vec<Column>>>()?;

    let places = match &spec.place_column {
        Some(name) => match df.column(name) {
            Ok(places) => Some(places.cast(&DataType::String)?),
            Err(_) => {
                warn!("{}: place column '{}' not found, ignoring", spec.name, name);
                None
            }
        },
        None => None,
    };

    let timestamps = timestamps.str()?;
    let latitudes = latitudes.f64()?;
    let longitudes = longitudes.f64()?;
    let values = values
        .iter()
        .map(|c| c.f64())
        .collect::<PolarsResult<Vec<_>>>()?;
    let places = places.as_ref().map(|c| c.str()).transpose()?;

    let mut observations = Vec::with_capacity(df.height());
    let mut bad_timestamps = 0usize;
    let mut missing_values = 0usize;

    for row in 0..df.height() {
        let Some(timestamp) = timestamps.get(row).and_then(parse_timestamp) else {
            bad_timestamps += 1;
            continue;
        };

        let row_values: Vec<Option<f64>> = values
            .iter()
            .map(|ca| ca.get(row).filter(|v| !v.is_nan()))
            .collect();
        if spec.require_value && row_values.first().copied().flatten().is_none() {
            missing_values += 1;
            continue;
        }

        let mut observation = Observation::new(
            timestamp,
            latitudes.get(row).unwrap_or(f64::NAN),
            longitudes.get(row).unwrap_or(f64::NAN),
            row_values,
        );
        if let Some(place) = places.and_then(|p| p.get(row)) {
            observation = observation.with_place_name(place);
        }
        observations.push(observation);
    }

    let dataset = MeasurementDataset::new(&spec.name, spec.value_columns.clone(), observations)?;

    if bad_timestamps > 0 || missing_values > 0 || dataset.excluded_rows() > 0 {
        warn!(
            "{}: skipped {} rows with invalid timestamps, {} without a value, {} with invalid coordinates",
            spec.name,
            bad_timestamps,
            missing_values,
            dataset.excluded_rows()
        );
    }
    debug!(
        "Loaded {} rows from {} ({} value columns)",
        dataset.len(),
        spec.path.display(),
        spec.value_columns.len()
    );

    Ok(dataset)
}

/// Load the ground truth and every auxiliary source concurrently.
///
/// Missing files are reported before any file is parsed.
pub async fn load_all(config: &FusionConfig) -> Result<LoadedDatasets> {
    let start = Instant::now();

    let mut specs = vec![
        DatasetSpec::ground_truth(config, &config.targets.primary, &config.primary),
        DatasetSpec::ground_truth(config, &config.targets.co_pollutant, &config.co_pollutant),
    ];
    specs.extend(config.sources.iter().map(|s| DatasetSpec::source(config, s)));

    if let Some(missing) = specs.iter().find(|s| !s.path.exists()) {
        return Err(FusionError::DatasetNotFound {
            path: missing.path.clone(),
        });
    }

    let loads = specs.into_iter().map(|spec| async move {
        task::spawn_blocking(move || load_dataset(&spec))
            .await
            .map_err(|e| FusionError::WorkerPool {
                reason: format!("dataset loader task failed: {}", e),
            })?
    });
    let mut datasets = try_join_all(loads).await?.into_iter();

    let (Some(primary), Some(co_pollutant)) = (datasets.next(), datasets.next()) else {
        return Err(FusionError::configuration("ground-truth datasets were not loaded"));
    };
    let sources: Vec<MeasurementDataset> = datasets.collect();

    info!(
        "Loaded {} ground-truth rows, {} co-pollutant rows and {} auxiliary sources in {:.2?}",
        primary.len(),
        co_pollutant.len(),
        sources.len(),
        start.elapsed()
    );
    for dataset in &sources {
        if dataset.is_empty() {
            warn!("Auxiliary source '{}' has no usable rows", dataset.name());
        }
    }

    Ok(LoadedDatasets {
        primary,
        co_pollutant,
        sources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::TempDir;

    fn utc(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert_eq!(parse_timestamp("2025-07-01 12:00:00"), Some(utc(12, 0, 0)));
        assert_eq!(parse_timestamp("2025-07-01T12:30:15"), Some(utc(12, 30, 15)));
        assert_eq!(parse_timestamp("2025-07-01T12:00:00Z"), Some(utc(12, 0, 0)));
        assert_eq!(parse_timestamp("2025-07-01 14:00:00+02:00"), Some(utc(12, 0, 0)));
        assert_eq!(parse_timestamp(" 2025-07-01 12:00 "), Some(utc(12, 0, 0)));
        assert_eq!(parse_timestamp("2025-07-01"), Some(utc(0, 0, 0)));
        assert_eq!(
            parse_timestamp("2025-07-01 12:00:00.250"),
            Some(utc(12, 0, 0) + chrono::Duration::milliseconds(250))
        );
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(parse_timestamp("2025-13-01 00:00:00"), None);
    }

    fn spec(path: PathBuf, values: &[&str]) -> DatasetSpec {
        DatasetSpec {
            name: "test".to_string(),
            path,
            timestamp_column: "datetime".to_string(),
            latitude_column: "latitude".to_string(),
            longitude_column: "longitude".to_string(),
            value_columns: values.iter().map(|v| v.to_string()).collect(),
            place_column: None,
            require_value: false,
        }
    }

    #[test]
    fn test_load_skips_bad_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("no2.csv");
        fs::write(
            &path,
            "datetime,latitude,longitude,no2\n\
             2025-07-01 12:00:00,40.0,-74.0,1.5\n\
             not-a-date,40.0,-74.0,2.5\n\
             2025-07-01 13:00:00,91.0,-74.0,3.5\n\
             2025-07-01 14:00:00,41.0,-75.0,\n",
        )
        .unwrap();

        let dataset = load_dataset(&spec(path, &["no2"])).unwrap();

        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.excluded_rows(), 1);
        assert_eq!(dataset.value(0, 0), Some(1.5));
        assert_eq!(dataset.value(1, 0), None);
    }

    #[test]
    fn test_required_value_and_place_names() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pm25.csv");
        fs::write(
            &path,
            "datetime,latitude,longitude,ground_pm25,city\n\
             2025-07-01 12:00:00,40.7,-74.0,12.0,New York\n\
             2025-07-01 12:00:00,34.0,-118.2,,Los Angeles\n",
        )
        .unwrap();

        let dataset = load_dataset(&DatasetSpec {
            place_column: Some("city".to_string()),
            require_value: true,
            ..spec(path, &["ground_pm25"])
        })
        .unwrap();

        assert_eq!(dataset.len(), 1);
        assert_eq!(
            dataset.observations()[0].place_name.as_deref(),
            Some("New York")
        );
    }

    #[test]
    fn test_missing_column_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("co.csv");
        fs::write(&path, "datetime,latitude,longitude,co\n2025-07-01,1,1,1\n").unwrap();

        let result = load_dataset(&spec(path, &["aod"]));

        assert!(matches!(
            result,
            Err(FusionError::MissingColumn { ref column, .. }) if column == "aod"
        ));
    }

    #[tokio::test]
    async fn test_load_all_fails_fast_on_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = FusionConfig::default().with_data_dir(dir.path());

        let result = load_all(&config).await;

        assert!(matches!(result, Err(FusionError::DatasetNotFound { .. })));
    }
}
