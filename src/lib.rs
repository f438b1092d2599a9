//! Air Quality Fusion Library
//!
//! Aligns ground-sensor pollutant readings with the nearest-in-time and
//! nearest-in-space values from satellite and weather datasets, producing a
//! fused table suitable for training pollution forecasting models.
//!
//! This library provides tools for:
//! - Loading heterogeneous CSV measurement datasets with polars
//! - Time-window filtering and R-tree nearest-neighbour lookup per source
//! - Assembling fused records in parallel chunks with a sequential fallback
//! - Preparing imputed feature and target matrices
//! - Fitting and evaluating a ridge regression baseline
//! - Writing fused tables and matrices as Parquet or CSV

pub mod aqi;
pub mod assembler;
pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod features;
pub mod loader;
pub mod models;
pub mod predictor;
pub mod resolver;
pub mod spatial;
pub mod temporal;
pub mod writer;

// Re-export commonly used types
pub use assembler::{FusionInputs, RecordAssembler};
pub use config::{FusionConfig, IncompletePolicy, SourceConfig, SpatialPolicy, ValueSelection};
pub use driver::FusionDriver;
pub use error::{FusionError, Result};
pub use features::{FeaturePreparer, PreparedData};
pub use models::{
    ExecutionMode, FeatureGroup, FusedRecord, FusedTable, FusionStats, MeasurementDataset,
    Observation, TargetNames,
};
pub use predictor::AirQualityPredictor;
pub use writer::{OutputFormat, TableWriter};
