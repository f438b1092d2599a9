//! Output writing for fused tables and prepared matrices.
//!
//! Tables are converted to polars `DataFrame`s and written as Parquet or
//! CSV. The fused table keeps a fixed column order: timestamp, location,
//! place name, targets, then features in configuration order.

use crate::error::Result;
use crate::features::{DesignMatrix, PreparedData};
use crate::models::{
    FusedTable, LATITUDE_COLUMN, LONGITUDE_COLUMN, PLACE_NAME_COLUMN, TIMESTAMP_COLUMN,
};
use clap::ValueEnum;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::debug;

/// File format of written tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Parquet,
    Csv,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Parquet => "parquet",
            OutputFormat::Csv => "csv",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

/// Parquet compression codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    Snappy,
    Zstd,
    Lz4,
    Uncompressed,
}

impl CompressionAlgorithm {
    /// Convert to polars ParquetCompression type
    pub fn to_polars_compression(&self) -> ParquetCompression {
        match self {
            CompressionAlgorithm::Snappy => ParquetCompression::Snappy,
            CompressionAlgorithm::Zstd => ParquetCompression::Zstd(None),
            CompressionAlgorithm::Lz4 => ParquetCompression::Lz4Raw,
            CompressionAlgorithm::Uncompressed => ParquetCompression::Uncompressed,
        }
    }
}

/// Zone attached to fused timestamps
pub const UTC_ZONE: &str = "UTC";

/// Build the output frame for a fused table
pub fn fused_table_frame(table: &FusedTable) -> Result<DataFrame> {
    let records = &table.records;

    let millis: Vec<i64> = records.iter().map(|r| r.timestamp.timestamp_millis()).collect();
    let timestamp = Column::new(TIMESTAMP_COLUMN.into(), millis)
        .cast(&DataType::Datetime(TimeUnit::Milliseconds, Some(UTC_ZONE.into())))?;

    let mut columns = vec![
        timestamp,
        Column::new(
            LATITUDE_COLUMN.into(),
            records.iter().map(|r| r.latitude).collect::<Vec<f64>>(),
        ),
        Column::new(
            LONGITUDE_COLUMN.into(),
            records.iter().map(|r| r.longitude).collect::<Vec<f64>>(),
        ),
        Column::new(
            PLACE_NAME_COLUMN.into(),
            records
                .iter()
                .map(|r| r.place_name.clone())
                .collect::<Vec<Option<String>>>(),
        ),
        Column::new(
            table.targets.primary.as_str().into(),
            records.iter().map(|r| r.primary).collect::<Vec<f64>>(),
        ),
        Column::new(
            table.targets.co_pollutant.as_str().into(),
            records.iter().map(|r| r.co_pollutant).collect::<Vec<f64>>(),
        ),
        Column::new(
            table.targets.composite_index.as_str().into(),
            records.iter().map(|r| r.composite_index).collect::<Vec<f64>>(),
        ),
    ];

    for (j, name) in table.feature_columns.iter().enumerate() {
        let values: Vec<Option<f64>> = records
            .iter()
            .map(|r| r.features.get(j).copied().flatten())
            .collect();
        columns.push(Column::new(name.as_str().into(), values));
    }

    Ok(DataFrame::new(columns)?)
}

/// Build a frame from a dense matrix, one column per name
pub fn matrix_frame(matrix: &DesignMatrix) -> Result<DataFrame> {
    let columns = matrix
        .columns
        .iter()
        .enumerate()
        .map(|(j, name)| Column::new(name.as_str().into(), matrix.values.column(j).to_vec()))
        .collect();

    Ok(DataFrame::new(columns)?)
}

/// Writes frames to disk in one format
#[derive(Debug, Clone, Copy, Default)]
pub struct TableWriter {
    format: OutputFormat,
    compression: CompressionAlgorithm,
}

impl TableWriter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            compression: CompressionAlgorithm::default(),
        }
    }

    pub fn with_compression(mut self, compression: CompressionAlgorithm) -> Self {
        self.compression = compression;
        self
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Write a frame, creating parent directories as needed
    pub fn write_frame(&self, df: &mut DataFrame, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = File::create(path)?;
        match self.format {
            OutputFormat::Parquet => {
                ParquetWriter::new(file)
                    .with_compression(self.compression.to_polars_compression())
                    .finish(df)?;
            }
            OutputFormat::Csv => {
                CsvWriter::new(file).include_header(true).finish(df)?;
            }
        }

        debug!(
            "Wrote {} rows x {} columns to {}",
            df.height(),
            df.width(),
            path.display()
        );
        Ok(())
    }

    /// Write the fused table to `path`; returns the row count
    pub fn write_fused(&self, table: &FusedTable, path: &Path) -> Result<usize> {
        let mut df = fused_table_frame(table)?;
        self.write_frame(&mut df, path)?;
        Ok(df.height())
    }

    /// Write `features.<ext>` and `targets.<ext>` into `dir`
    pub fn write_prepared(&self, data: &PreparedData, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        let features_path = dir.join(format!("features.{}", self.format.extension()));
        let targets_path = dir.join(format!("targets.{}", self.format.extension()));

        self.write_frame(&mut matrix_frame(&data.features)?, &features_path)?;
        self.write_frame(&mut matrix_frame(&data.targets)?, &targets_path)?;

        Ok((features_path, targets_path))
    }
}
