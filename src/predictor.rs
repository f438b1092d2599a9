//! Multi-target regression over prepared feature/target matrices.
//!
//! One [`Regressor`] is fitted per target column on standardised features.
//! Rows are split deterministically into train/validation/test (60/20/20),
//! the scaler is fitted on the training rows only, and each split is scored
//! with R², RMSE and MAE. Linear models also report which features carry
//! the most weight.

use crate::aqi::{self, HealthRisk};
use crate::error::{FusionError, Result};
use crate::features::{CALENDAR_FEATURES, PreparedData, calendar_features};
use crate::models::TargetNames;
use chrono::{DateTime, Utc};
use linfa::Dataset;
use linfa::prelude::SingleTargetRegression;
use linfa::traits::{Fit, Predict, Transformer};
use linfa_elasticnet::ElasticNet;
use linfa_preprocessing::linear_scaling::LinearScaler;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

/// Default L2 penalty of the ridge baseline
pub const DEFAULT_RIDGE_ALPHA: f64 = 1.0;

/// Features listed per target in the training summary
pub const TOP_FEATURES: usize = 5;

/// A single-output regression model
pub trait Regressor: Send + Sync {
    fn fit(&mut self, x: &Array2<f64>, y: ArrayView1<'_, f64>) -> Result<()>;

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>>;

    /// Per-feature weights, for models that have them
    fn coefficients(&self) -> Option<ArrayView1<'_, f64>> {
        None
    }
}

/// Ridge regression: an elastic net with a pure L2 penalty and an
/// unpenalised intercept
pub struct RidgeRegression {
    alpha: f64,
    model: Option<ElasticNet<f64>>,
}

impl fmt::Debug for RidgeRegression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RidgeRegression")
            .field("alpha", &self.alpha)
            .field("fitted", &self.model.is_some())
            .finish()
    }
}

impl Default for RidgeRegression {
    fn default() -> Self {
        Self::new(DEFAULT_RIDGE_ALPHA)
    }
}

impl RidgeRegression {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, model: None }
    }

    pub fn intercept(&self) -> Option<f64> {
        self.model.as_ref().map(|m| m.intercept())
    }
}

impl Regressor for RidgeRegression {
    fn fit(&mut self, x: &Array2<f64>, y: ArrayView1<'_, f64>) -> Result<()> {
        if x.nrows() == 0 {
            return Err(FusionError::model("cannot fit on zero rows"));
        }
        if x.nrows() != y.len() {
            return Err(FusionError::model(format!(
                "{} feature rows but {} targets",
                x.nrows(),
                y.len()
            )));
        }
        if !(self.alpha.is_finite() && self.alpha > 0.0) {
            return Err(FusionError::model(format!(
                "ridge alpha must be positive, got {}",
                self.alpha
            )));
        }

        let dataset = Dataset::new(x.to_owned(), y.to_owned());
        let model = ElasticNet::<f64>::params()
            .penalty(self.alpha)
            .l1_ratio(0.0)
            .tolerance(1e-10)
            .max_iterations(10_000)
            .fit(&dataset)
            .map_err(|e| FusionError::model(format!("ridge fit failed: {}", e)))?;

        self.model = Some(model);
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| FusionError::model("model has not been fitted"))?;
        let expected = model.hyperplane().len();
        if x.ncols() != expected {
            return Err(FusionError::model(format!(
                "expected {} features, got {}",
                expected,
                x.ncols()
            )));
        }
        Ok(model.predict(x))
    }

    fn coefficients(&self) -> Option<ArrayView1<'_, f64>> {
        self.model.as_ref().map(|m| m.hyperplane().view())
    }
}

/// Fit a standard scaler on training rows. Zero-variance columns keep a
/// unit scale, so they centre to zero.
fn fit_scaler(x: &Array2<f64>, y: &Array2<f64>) -> Result<LinearScaler<f64>> {
    if x.nrows() == 0 {
        return Err(FusionError::model("cannot fit scaler on zero rows"));
    }
    LinearScaler::standard()
        .fit(&Dataset::new(x.to_owned(), y.to_owned()))
        .map_err(|e| FusionError::model(format!("scaler fit failed: {}", e)))
}

/// Partition of the prepared rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl Split {
    /// Deterministic 60/20/20 assignment by row position
    pub fn of_row(row: usize) -> Self {
        match row % 5 {
            3 => Split::Validation,
            4 => Split::Test,
            _ => Split::Train,
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Validation => write!(f, "validation"),
            Split::Test => write!(f, "test"),
        }
    }
}

/// Regression quality of one target on one split
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metrics {
    pub r2: f64,
    pub rmse: f64,
    pub mae: f64,
}

impl Metrics {
    /// `None` for empty or misaligned inputs
    pub fn evaluate(actual: ArrayView1<'_, f64>, predicted: ArrayView1<'_, f64>) -> Option<Self> {
        if actual.is_empty() || actual.len() != predicted.len() {
            return None;
        }

        let actual = actual.to_owned();
        let predicted = predicted.to_owned();
        Some(Self {
            r2: predicted.r2(&actual).ok()?,
            rmse: predicted.mean_squared_error(&actual).ok()?.sqrt(),
            mae: predicted.mean_absolute_error(&actual).ok()?,
        })
    }
}

/// Standardised coefficients of one target's model
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureImportance {
    pub target: String,
    /// Sorted by descending magnitude
    pub ranked: Vec<(String, f64)>,
}

impl FeatureImportance {
    fn rank(target: &str, features: &[String], coefficients: ArrayView1<'_, f64>) -> Self {
        let mut ranked: Vec<(String, f64)> = features
            .iter()
            .cloned()
            .zip(coefficients.iter().copied())
            .collect();
        ranked.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));
        Self {
            target: target.to_string(),
            ranked,
        }
    }

    pub fn top(&self, n: usize) -> &[(String, f64)] {
        &self.ranked[..n.min(self.ranked.len())]
    }
}

/// Metrics of every target on one split
#[derive(Debug, Clone, PartialEq)]
pub struct SplitReport {
    pub split: Split,
    pub rows: usize,
    pub metrics: Vec<(String, Metrics)>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrainingReport {
    pub splits: Vec<SplitReport>,
    pub importances: Vec<FeatureImportance>,
}

impl TrainingReport {
    pub fn get(&self, split: Split) -> Option<&SplitReport> {
        self.splits.iter().find(|s| s.split == split)
    }

    pub fn importance(&self, target: &str) -> Option<&FeatureImportance> {
        self.importances.iter().find(|i| i.target == target)
    }
}

/// Point prediction for one location and time
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub timestamp: DateTime<Utc>,
    pub outputs: Vec<(String, f64)>,
    pub health_risk: Option<HealthRisk>,
}

impl Prediction {
    pub fn get(&self, target: &str) -> Option<f64> {
        self.outputs
            .iter()
            .find(|(name, _)| name == target)
            .map(|(_, value)| *value)
    }
}

/// Scaler plus one fitted regressor per target
pub struct AirQualityPredictor {
    feature_columns: Vec<String>,
    target_columns: Vec<String>,
    targets: TargetNames,
    scaler: LinearScaler<f64>,
    models: Vec<Box<dyn Regressor>>,
}

impl fmt::Debug for AirQualityPredictor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AirQualityPredictor")
            .field("feature_columns", &self.feature_columns)
            .field("target_columns", &self.target_columns)
            .field("models", &self.models.len())
            .finish()
    }
}

impl AirQualityPredictor {
    /// Fit the ridge baseline on `data`
    pub fn train_ridge(
        data: &PreparedData,
        targets: TargetNames,
        alpha: f64,
    ) -> Result<(Self, TrainingReport)> {
        Self::train(data, targets, || {
            Box::new(RidgeRegression::new(alpha)) as Box<dyn Regressor>
        })
    }

    /// Fit one regressor per target column, created by `make_model`
    pub fn train<F>(
        data: &PreparedData,
        targets: TargetNames,
        make_model: F,
    ) -> Result<(Self, TrainingReport)>
    where
        F: Fn() -> Box<dyn Regressor>,
    {
        let splits = split_rows(data.len());
        let train_rows = &splits[&Split::Train];
        if train_rows.is_empty() {
            return Err(FusionError::model("no rows available for training"));
        }

        info!(
            "Training on {} rows ({} validation, {} test), {} features, {} targets",
            train_rows.len(),
            splits[&Split::Validation].len(),
            splits[&Split::Test].len(),
            data.features.ncols(),
            data.targets.ncols()
        );

        let x_train = data.features.values.select(Axis(0), train_rows);
        let y_train = data.targets.values.select(Axis(0), train_rows);
        let scaler = fit_scaler(&x_train, &y_train)?;
        let x_train = scaler.transform(x_train);

        let mut models = Vec::with_capacity(data.targets.ncols());
        for (j, target) in data.targets.columns.iter().enumerate() {
            let mut model = make_model();
            model.fit(&x_train, y_train.column(j))?;
            debug!("Fitted model for '{}'", target);
            models.push(model);
        }

        let predictor = Self {
            feature_columns: data.features.columns.clone(),
            target_columns: data.targets.columns.clone(),
            targets,
            scaler,
            models,
        };

        let mut report = TrainingReport {
            importances: predictor.feature_importance(),
            ..Default::default()
        };
        for split in [Split::Train, Split::Validation, Split::Test] {
            let rows = &splits[&split];
            if rows.is_empty() {
                continue;
            }
            let x = data.features.values.select(Axis(0), rows);
            let y = data.targets.values.select(Axis(0), rows);
            report.splits.push(predictor.score(split, &x, &y)?);
        }

        Ok((predictor, report))
    }

    pub fn feature_columns(&self) -> &[String] {
        &self.feature_columns
    }

    pub fn target_columns(&self) -> &[String] {
        &self.target_columns
    }

    /// Standardised coefficients per target, for models that expose them
    pub fn feature_importance(&self) -> Vec<FeatureImportance> {
        self.target_columns
            .iter()
            .zip(&self.models)
            .filter_map(|(target, model)| {
                let coefficients = model.coefficients()?;
                Some(FeatureImportance::rank(
                    target,
                    &self.feature_columns,
                    coefficients,
                ))
            })
            .collect()
    }

    /// Predict every target for raw (unscaled) feature rows
    pub fn predict_matrix(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.feature_columns.len() {
            return Err(FusionError::model(format!(
                "expected {} feature columns, got {}",
                self.feature_columns.len(),
                x.ncols()
            )));
        }

        let scaled = self.scaler.transform(x.to_owned());
        let mut out = Array2::zeros((x.nrows(), self.models.len()));
        for (j, model) in self.models.iter().enumerate() {
            out.column_mut(j).assign(&model.predict(&scaled)?);
        }
        Ok(out)
    }

    /// Predict from named feature values at `timestamp`.
    ///
    /// Calendar features come from the timestamp; any other feature not in
    /// `inputs` (or NaN) is taken as 0.0.
    pub fn predict(&self, inputs: &HashMap<String, f64>, timestamp: DateTime<Utc>) -> Result<Prediction> {
        let calendar = calendar_features(timestamp);
        let row: Vec<f64> = self
            .feature_columns
            .iter()
            .map(|name| {
                if let Some(i) = CALENDAR_FEATURES.iter().position(|c| name == *c) {
                    return calendar[i];
                }
                inputs
                    .get(name)
                    .copied()
                    .filter(|v| v.is_finite())
                    .unwrap_or(0.0)
            })
            .collect();

        let x = Array2::from_shape_vec((1, row.len()), row)
            .map_err(|e| FusionError::model(e.to_string()))?;
        let predicted = self.predict_matrix(&x)?;

        let outputs: Vec<(String, f64)> = self
            .target_columns
            .iter()
            .cloned()
            .zip(predicted.row(0).iter().copied())
            .collect();

        let mut prediction = Prediction {
            timestamp,
            outputs,
            health_risk: None,
        };
        let index = prediction.get(&self.targets.composite_index).or_else(|| {
            let primary = prediction.get(&self.targets.primary)?;
            let co_pollutant = prediction.get(&self.targets.co_pollutant)?;
            Some(aqi::composite_index(primary, co_pollutant))
        });
        prediction.health_risk = index.map(HealthRisk::from_index);

        Ok(prediction)
    }

    fn score(&self, split: Split, x: &Array2<f64>, y: &Array2<f64>) -> Result<SplitReport> {
        let predicted = self.predict_matrix(x)?;
        let metrics = self
            .target_columns
            .iter()
            .enumerate()
            .filter_map(|(j, target)| {
                Metrics::evaluate(y.column(j), predicted.column(j)).map(|m| (target.clone(), m))
            })
            .collect();

        Ok(SplitReport {
            split,
            rows: x.nrows(),
            metrics,
        })
    }
}

fn split_rows(rows: usize) -> HashMap<Split, Vec<usize>> {
    let mut splits: HashMap<Split, Vec<usize>> = [Split::Train, Split::Validation, Split::Test]
        .into_iter()
        .map(|s| (s, Vec::new()))
        .collect();
    for row in 0..rows {
        splits.entry(Split::of_row(row)).or_default().push(row);
    }
    splits
}
