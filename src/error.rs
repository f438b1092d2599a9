//! Error handling for fusion operations.
//!
//! Covers load-time configuration failures, tabular I/O errors, worker pool
//! failures and model fitting problems. Missing auxiliary matches and missing
//! co-pollutant rows are not errors: they are counted in
//! [`FusionStats`](crate::models::FusionStats) and the row is dropped.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FusionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Dataset not found at path: {path}")]
    DatasetNotFound { path: PathBuf },

    #[error("Dataset '{dataset}' is missing required column '{column}'")]
    MissingColumn { dataset: String, column: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Worker pool failed: {reason}")]
    WorkerPool { reason: String },

    #[error("Model error: {message}")]
    Model { message: String },
}

impl FusionError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn missing_column(dataset: impl Into<String>, column: impl Into<String>) -> Self {
        Self::MissingColumn {
            dataset: dataset.into(),
            column: column.into(),
        }
    }

    pub fn model(message: impl Into<String>) -> Self {
        Self::Model {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FusionError>;
