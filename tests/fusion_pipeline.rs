//! Integration tests for the fusion pipeline
//!
//! Builds small in-memory and on-disk datasets for a handful of US cities and
//! runs them through assembly, the parallel driver, feature preparation and
//! the writers.

use aq_fusion::aqi::composite_index;
use aq_fusion::config::{FusionConfig, IncompletePolicy, SourceConfig, SpatialPolicy, ValueSelection};
use aq_fusion::driver::FusionDriver;
use aq_fusion::features::FeaturePreparer;
use aq_fusion::loader;
use aq_fusion::models::{ExecutionMode, FeatureGroup, MeasurementDataset, Observation};
use aq_fusion::predictor::AirQualityPredictor;
use aq_fusion::writer::{OutputFormat, TableWriter};
use aq_fusion::{FusionError, FusionInputs};
use chrono::{DateTime, Duration, TimeZone, Utc};
use polars::prelude::*;
use std::fs;
use tempfile::TempDir;

const CITIES: [(&str, f64, f64); 3] = [
    ("New York", 40.7128, -74.0060),
    ("Los Angeles", 34.0522, -118.2437),
    ("Chicago", 41.8781, -87.6298),
];

fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap()
}

fn single(name: &str, group: FeatureGroup, column: &str) -> SourceConfig {
    SourceConfig::new(
        name,
        format!("{}.csv", name),
        group,
        ValueSelection::Column(column.to_string()),
    )
}

fn wind_source() -> SourceConfig {
    SourceConfig::new(
        "merra2_wind",
        "merra2_wind.csv",
        FeatureGroup::Weather,
        ValueSelection::Columns(vec!["wind_U".to_string(), "wind_speed".to_string()]),
    )
}

fn config() -> FusionConfig {
    FusionConfig::default().with_sources(vec![
        single("tempo_no2", FeatureGroup::Satellite, "no2"),
        wind_source(),
    ])
}

fn dataset(name: &str, columns: &[&str], rows: Vec<Observation>) -> MeasurementDataset {
    MeasurementDataset::new(
        name,
        columns.iter().map(|c| c.to_string()).collect(),
        rows,
    )
    .unwrap()
}

fn ground_truth(name: &str, value: impl Fn(usize) -> f64) -> MeasurementDataset {
    let rows = CITIES
        .iter()
        .enumerate()
        .map(|(i, (city, lat, lon))| {
            Observation::new(noon(), *lat, *lon, vec![Some(value(i))]).with_place_name(*city)
        })
        .collect();
    dataset(name, &["value"], rows)
}

/// Satellite pixels 0.1° north-east of each city, an hour before noon
fn satellite() -> MeasurementDataset {
    let rows = CITIES
        .iter()
        .enumerate()
        .map(|(i, (_, lat, lon))| {
            Observation::new(
                noon() - Duration::hours(1),
                lat + 0.1,
                lon + 0.1,
                vec![Some(1.0e15 * (i + 1) as f64)],
            )
        })
        .collect();
    dataset("tempo_no2", &["no2"], rows)
}

fn wind(cities: &[usize]) -> MeasurementDataset {
    let rows = cities
        .iter()
        .map(|&i| {
            let (_, lat, lon) = CITIES[i];
            Observation::new(noon(), lat, lon, vec![Some(-1.5), Some(3.0 + i as f64)])
        })
        .collect();
    dataset("merra2_wind", &["wind_U", "wind_speed"], rows)
}

#[test]
fn test_three_cities_fuse_with_satellite_and_weather() {
    let config = config();
    let pm25 = ground_truth("pm25", |i| 10.0 + 5.0 * i as f64);
    let o3 = ground_truth("o3", |i| 60.0 + 20.0 * i as f64);
    let inputs = FusionInputs::new(&config, pm25, &o3, vec![satellite(), wind(&[0, 1, 2])]).unwrap();

    let (table, stats) = FusionDriver::new(4).run(&inputs).unwrap();

    assert_eq!(stats.ground_truth_rows, 3);
    assert_eq!(stats.fused_rows, 3);
    assert_eq!(stats.dropped_rows(), 0);
    assert_eq!(
        table.feature_columns,
        vec!["tempo_no2", "wind_U", "wind_speed"]
    );

    for (i, record) in table.records.iter().enumerate() {
        let pm25 = 10.0 + 5.0 * i as f64;
        let o3 = 60.0 + 20.0 * i as f64;
        assert_eq!(record.place_name.as_deref(), Some(CITIES[i].0));
        assert_eq!(record.primary, pm25);
        assert_eq!(record.co_pollutant, o3);
        assert!((record.composite_index - composite_index(pm25, o3)).abs() < 1e-12);
        assert_eq!(record.features[0], Some(1.0e15 * (i + 1) as f64));
        assert_eq!(record.features[1], Some(-1.5));
        assert_eq!(record.features[2], Some(3.0 + i as f64));
    }
}

#[test]
fn test_rows_without_co_pollutant_or_weather_are_dropped() {
    let config = config();

    // Los Angeles reports in the evening, far outside the 2h wind window;
    // Chicago has no O3 reading at all
    let at = |i: usize| {
        if i == 1 {
            noon() + Duration::hours(8)
        } else {
            noon()
        }
    };
    let rows = |value: f64, cities: usize| {
        CITIES[..cities]
            .iter()
            .enumerate()
            .map(|(i, (city, lat, lon))| {
                Observation::new(at(i), *lat, *lon, vec![Some(value)]).with_place_name(*city)
            })
            .collect::<Vec<_>>()
    };
    let pm25 = dataset("pm25", &["value"], rows(20.0, 3));
    let o3 = dataset("o3", &["value"], rows(80.0, 2));
    let inputs = FusionInputs::new(&config, pm25, &o3, vec![satellite(), wind(&[0, 2])]).unwrap();

    let (table, stats) = FusionDriver::new(2).run(&inputs).unwrap();

    assert_eq!(stats.fused_rows, 1);
    assert_eq!(stats.dropped_missing_co_pollutant, 1);
    assert_eq!(stats.dropped_incomplete, 1);
    assert_eq!(table.records[0].place_name.as_deref(), Some("New York"));
}

#[test]
fn test_strict_spatial_and_drop_incomplete_remove_distant_matches() {
    let config = config()
        .with_sources(vec![
            single("tempo_no2", FeatureGroup::Satellite, "no2").with_spatial_tolerance(0.05),
            wind_source(),
        ])
        .with_spatial_policy(SpatialPolicy::WithinTolerance)
        .with_incomplete_policy(IncompletePolicy::DropAnyMissing);
    let pm25 = ground_truth("pm25", |_| 20.0);
    let o3 = ground_truth("o3", |_| 80.0);
    let inputs = FusionInputs::new(&config, pm25, &o3, vec![satellite(), wind(&[0, 1, 2])]).unwrap();

    let (table, stats) = FusionDriver::new(2).run(&inputs).unwrap();

    // Every satellite pixel sits ~0.14° away, beyond the 0.05° tolerance
    assert!(table.is_empty());
    assert_eq!(stats.dropped_incomplete, 3);
}

#[test]
fn test_parallel_and_sequential_runs_agree() {
    let config = config();
    let mut pm25_rows = Vec::new();
    let mut o3_rows = Vec::new();
    for hour in 0..48 {
        for (i, (_, lat, lon)) in CITIES.iter().enumerate() {
            let ts = noon() + Duration::hours(hour);
            pm25_rows.push(Observation::new(ts, *lat, *lon, vec![Some(5.0 + hour as f64 + i as f64)]));
            o3_rows.push(Observation::new(ts, *lat, *lon, vec![Some(40.0 + i as f64)]));
        }
    }
    let pm25 = dataset("pm25", &["value"], pm25_rows);
    let o3 = dataset("o3", &["value"], o3_rows);
    let inputs = FusionInputs::new(&config, pm25, &o3, vec![satellite(), wind(&[0, 1, 2])]).unwrap();

    let (parallel, parallel_stats) = FusionDriver::new(8).run(&inputs).unwrap();
    let (sequential, sequential_stats) = FusionDriver::new(8)
        .with_mode(ExecutionMode::Sequential)
        .run(&inputs)
        .unwrap();

    assert_eq!(parallel.records, sequential.records);
    assert_eq!(parallel_stats.fused_rows, sequential_stats.fused_rows);
    assert_eq!(sequential_stats.mode, ExecutionMode::Sequential);
}

fn write_csv(dir: &std::path::Path, name: &str, text: &str) {
    fs::write(dir.join(name), text).unwrap();
}

/// One week of hourly readings for three cities, as CSV files
fn write_datasets(dir: &std::path::Path) {
    let mut pm25 = String::from("datetime,latitude,longitude,city,ground_pm25\n");
    let mut o3 = String::from("datetime,latitude,longitude,ground_o3\n");
    let mut no2 = String::from("datetime,latitude,longitude,no2\n");
    let mut wind = String::from("datetime,latitude,longitude,wind_U,wind_speed\n");

    for hour in 0..24 * 7 {
        let ts = noon() + Duration::hours(hour);
        let stamp = ts.format("%Y-%m-%d %H:%M:%S");
        for (i, (city, lat, lon)) in CITIES.iter().enumerate() {
            let level = 8.0 + (hour % 24) as f64 * 0.5 + i as f64 * 3.0;
            pm25.push_str(&format!("{},{},{},{},{}\n", stamp, lat, lon, city, level));
            o3.push_str(&format!("{},{},{},{}\n", stamp, lat, lon, 50.0 + level));
            no2.push_str(&format!("{},{},{},{}\n", stamp, lat + 0.05, lon, level * 1.0e14));
            wind.push_str(&format!("{},{},{},-1.0,{}\n", stamp, lat, lon, 2.0 + i as f64));
        }
    }
    // A row with no reading is skipped at load
    pm25.push_str("2025-07-01 12:00:00,40.7128,-74.006,New York,\n");

    write_csv(dir, "pm25.csv", &pm25);
    write_csv(dir, "o3.csv", &o3);
    write_csv(dir, "tempo_no2.csv", &no2);
    write_csv(dir, "merra2_wind.csv", &wind);
}

fn disk_config(dir: &std::path::Path) -> FusionConfig {
    let mut config = config().with_data_dir(dir);
    config.primary.file = "pm25.csv".into();
    config.co_pollutant.file = "o3.csv".into();
    config.feature_columns = ["tempo_no2", "wind_speed", "hour", "day_of_year", "is_weekend"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    config.target_columns = vec!["pm25".to_string(), "aqi".to_string()];
    config
}

#[tokio::test]
async fn test_csv_files_to_fused_csv_output() {
    let data = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    write_datasets(data.path());
    let config = disk_config(data.path());
    config.validate().unwrap();

    let loaded = loader::load_all(&config).await.unwrap();
    assert_eq!(loaded.primary.len(), 3 * 24 * 7);

    let inputs = FusionInputs::new(&config, loaded.primary, &loaded.co_pollutant, loaded.sources)
        .unwrap();
    let (table, stats) = FusionDriver::new(4).run(&inputs).unwrap();
    assert_eq!(stats.fused_rows, 3 * 24 * 7);

    let path = out.path().join("fused.csv");
    let rows = TableWriter::new(OutputFormat::Csv)
        .write_fused(&table, &path)
        .unwrap();
    assert_eq!(rows, table.len());

    let df = CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path))
        .unwrap()
        .finish()
        .unwrap();
    assert_eq!(df.height(), 3 * 24 * 7);
    assert!(df.column("place_name").is_ok());
    assert!(df.column("wind_speed").is_ok());
}

#[tokio::test]
async fn test_prepare_and_train_from_csv_files() {
    let data = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    write_datasets(data.path());
    let config = disk_config(data.path());

    let loaded = loader::load_all(&config).await.unwrap();
    let inputs = FusionInputs::new(&config, loaded.primary, &loaded.co_pollutant, loaded.sources)
        .unwrap();
    let (table, _) = FusionDriver::new(4).run(&inputs).unwrap();

    let prepared = FeaturePreparer::from_config(&config).prepare(&table).unwrap();
    assert_eq!(prepared.features.ncols(), 5);
    assert_eq!(prepared.targets.ncols(), 2);

    let (features, targets) = TableWriter::new(OutputFormat::Parquet)
        .write_prepared(&prepared, out.path())
        .unwrap();
    assert!(features.exists());
    assert!(targets.exists());

    let (predictor, report) =
        AirQualityPredictor::train_ridge(&prepared, config.targets.clone(), 1.0).unwrap();
    assert_eq!(report.splits.len(), 3);
    assert_eq!(predictor.target_columns(), ["pm25", "aqi"]);
    let importance = report.importance("pm25").unwrap();
    assert_eq!(importance.ranked.len(), 5);
    assert!(importance.ranked.windows(2).all(|w| w[0].1.abs() >= w[1].1.abs()));
}

#[tokio::test]
async fn test_missing_dataset_file_is_reported() {
    let data = TempDir::new().unwrap();
    write_datasets(data.path());
    fs::remove_file(data.path().join("merra2_wind.csv")).unwrap();

    let result = loader::load_all(&disk_config(data.path())).await;

    let Err(FusionError::DatasetNotFound { path }) = result else {
        panic!("expected a missing dataset error");
    };
    assert!(path.ends_with("merra2_wind.csv"));
}
