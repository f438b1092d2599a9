//! Configuration management and validation.
//!
//! Describes the ground-truth inputs, every auxiliary source with its own
//! temporal and spatial tolerance, the downstream feature/target selection,
//! and the fusion policies. The default configuration reproduces the
//! standard satellite + reanalysis + ground-sensor setup.

use crate::error::{FusionError, Result};
use crate::features::CALENDAR_FEATURES;
use crate::models::{FeatureGroup, RESERVED_COLUMNS, TargetNames};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default temporal tolerance for hourly sources
pub const DEFAULT_TIME_TOLERANCE_HOURS: f64 = 2.0;

/// Default spatial tolerance in coordinate degrees
pub const DEFAULT_SPATIAL_TOLERANCE: f64 = 1.0;

/// Upper bound on fusion chunks regardless of available cores
pub const DEFAULT_MAX_WORKERS: usize = 8;

fn default_time_tolerance() -> f64 {
    DEFAULT_TIME_TOLERANCE_HOURS
}

fn default_spatial_tolerance() -> f64 {
    DEFAULT_SPATIAL_TOLERANCE
}

/// What to do when the nearest in-time row is further than the spatial tolerance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpatialPolicy {
    /// Return the closest row in the time window whatever its distance
    #[default]
    ClosestAvailable,
    /// Treat rows beyond the spatial tolerance as no match
    WithinTolerance,
}

/// Which incomplete fused rows are discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncompletePolicy {
    /// Drop a row only when a configured feature group contributed nothing;
    /// individual missing features are left for imputation
    #[default]
    RequireGroups,
    /// Drop a row when any feature is missing
    DropAnyMissing,
}

/// Value column(s) read from an auxiliary source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueSelection {
    /// One column, emitted under the source name
    Column(String),
    /// Several columns, emitted under their own names and only when matched
    Columns(Vec<String>),
}

impl ValueSelection {
    pub fn columns(&self) -> Vec<&str> {
        match self {
            ValueSelection::Column(column) => vec![column.as_str()],
            ValueSelection::Columns(columns) => columns.iter().map(String::as_str).collect(),
        }
    }
}

/// A ground-truth input (the driving pollutant or the co-pollutant)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthConfig {
    pub file: PathBuf,
    pub value_column: String,
    #[serde(default)]
    pub place_column: Option<String>,
}

impl GroundTruthConfig {
    pub fn new(file: impl Into<PathBuf>, value_column: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            value_column: value_column.into(),
            place_column: None,
        }
    }

    pub fn with_place_column(mut self, column: impl Into<String>) -> Self {
        self.place_column = Some(column.into());
        self
    }
}

/// An auxiliary satellite or weather source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub file: PathBuf,
    pub group: FeatureGroup,
    pub values: ValueSelection,
    #[serde(default = "default_time_tolerance")]
    pub time_tolerance_hours: f64,
    #[serde(default = "default_spatial_tolerance")]
    pub spatial_tolerance: f64,
    /// Substituted when nothing matches (e.g. 0.0 for precipitation)
    #[serde(default)]
    pub missing_default: Option<f64>,
}

impl SourceConfig {
    pub fn new(
        name: impl Into<String>,
        file: impl Into<PathBuf>,
        group: FeatureGroup,
        values: ValueSelection,
    ) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
            group,
            values,
            time_tolerance_hours: DEFAULT_TIME_TOLERANCE_HOURS,
            spatial_tolerance: DEFAULT_SPATIAL_TOLERANCE,
            missing_default: None,
        }
    }

    pub fn with_time_tolerance(mut self, hours: f64) -> Self {
        self.time_tolerance_hours = hours;
        self
    }

    pub fn with_spatial_tolerance(mut self, degrees: f64) -> Self {
        self.spatial_tolerance = degrees;
        self
    }

    pub fn with_missing_default(mut self, value: f64) -> Self {
        self.missing_default = Some(value);
        self
    }

    /// Output feature names contributed by this source
    pub fn feature_names(&self) -> Vec<String> {
        match &self.values {
            ValueSelection::Column(_) => vec![self.name.clone()],
            ValueSelection::Columns(columns) => columns.clone(),
        }
    }
}

/// Global configuration for a fusion run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Directory that relative dataset paths are resolved against
    pub data_dir: PathBuf,

    pub timestamp_column: String,
    pub latitude_column: String,
    pub longitude_column: String,

    /// Ground truth driving iteration
    pub primary: GroundTruthConfig,

    /// Ground truth matched by exact (time, lat, lon)
    pub co_pollutant: GroundTruthConfig,

    pub targets: TargetNames,

    pub sources: Vec<SourceConfig>,

    /// Columns selected into the feature matrix
    pub feature_columns: Vec<String>,

    /// Columns selected into the target matrix
    pub target_columns: Vec<String>,

    pub spatial_policy: SpatialPolicy,

    pub incomplete_policy: IncompletePolicy,

    /// Cap on fusion chunks (the effective count is also capped by cores)
    pub max_workers: usize,

    /// Spatial indices cached per worker
    pub index_cache_capacity: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        use FeatureGroup::{Satellite, Weather};

        let sources = vec![
            SourceConfig::new(
                "tempo_no2",
                "tempo_no2_90days.csv",
                Satellite,
                ValueSelection::Column("no2".to_string()),
            ),
            SourceConfig::new(
                "tempo_ch2o",
                "tempo_ch2o_90days.csv",
                Satellite,
                ValueSelection::Column("ch2o".to_string()),
            ),
            SourceConfig::new(
                "tropomi_co",
                "tropomi_co_90days.csv",
                Satellite,
                ValueSelection::Column("co".to_string()),
            )
            .with_time_tolerance(12.0),
            SourceConfig::new(
                "modis_aod",
                "modis_aod_90days.csv",
                Satellite,
                ValueSelection::Column("aod".to_string()),
            )
            .with_time_tolerance(6.0),
            SourceConfig::new(
                "temperature_2m",
                "merra2_temperature_90days.csv",
                Weather,
                ValueSelection::Column("temperature_2m".to_string()),
            ),
            SourceConfig::new(
                "pbl_height",
                "merra2_pbl_90days.csv",
                Weather,
                ValueSelection::Column("pbl_height".to_string()),
            ),
            SourceConfig::new(
                "merra2_wind",
                "merra2_wind_90days.csv",
                Weather,
                ValueSelection::Columns(vec![
                    "wind_U".to_string(),
                    "wind_V".to_string(),
                    "wind_speed".to_string(),
                ]),
            ),
            SourceConfig::new(
                "precipitation",
                "gpm_precipitation_90days.csv",
                Weather,
                ValueSelection::Column("precipitation".to_string()),
            )
            .with_missing_default(0.0),
        ];

        let feature_columns = [
            "tempo_no2",
            "tempo_ch2o",
            "tropomi_co",
            "modis_aod",
            "temperature_2m",
            "pbl_height",
            "wind_speed",
            "precipitation",
            "hour",
            "day_of_year",
            "is_weekend",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let targets = TargetNames::default();
        let target_columns = vec![
            targets.primary.clone(),
            targets.co_pollutant.clone(),
            targets.composite_index.clone(),
        ];

        Self {
            data_dir: PathBuf::from("data"),
            timestamp_column: "datetime".to_string(),
            latitude_column: "latitude".to_string(),
            longitude_column: "longitude".to_string(),
            primary: GroundTruthConfig::new("openaq_pm25_90days.csv", "ground_pm25")
                .with_place_column("city"),
            co_pollutant: GroundTruthConfig::new("openaq_o3_90days.csv", "ground_o3"),
            targets,
            sources,
            feature_columns,
            target_columns,
            spatial_policy: SpatialPolicy::default(),
            incomplete_policy: IncompletePolicy::default(),
            max_workers: DEFAULT_MAX_WORKERS,
            index_cache_capacity: 256,
        }
    }
}

impl FusionConfig {
    /// Load a JSON configuration file; absent fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FusionError::DatasetNotFound {
                path: path.to_path_buf(),
            });
        }

        let text = std::fs::read_to_string(path)?;
        let config: FusionConfig = serde_json::from_str(&text)?;
        debug!(
            "Loaded configuration from {} ({} auxiliary sources)",
            path.display(),
            config.sources.len()
        );
        Ok(config)
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_sources(mut self, sources: Vec<SourceConfig>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_feature_columns(mut self, columns: Vec<String>) -> Self {
        self.feature_columns = columns;
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn with_spatial_policy(mut self, policy: SpatialPolicy) -> Self {
        self.spatial_policy = policy;
        self
    }

    pub fn with_incomplete_policy(mut self, policy: IncompletePolicy) -> Self {
        self.incomplete_policy = policy;
        self
    }

    /// Resolve a dataset path against `data_dir`
    pub fn resolve(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.data_dir.join(file)
        }
    }

    /// Every fused feature column, in source order
    pub fn feature_layout(&self) -> Vec<String> {
        self.sources
            .iter()
            .flat_map(SourceConfig::feature_names)
            .collect()
    }

    /// Reject configurations that cannot produce a complete fused table
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(FusionError::configuration("max_workers must be at least 1"));
        }
        if self.index_cache_capacity == 0 {
            return Err(FusionError::configuration(
                "index_cache_capacity must be at least 1",
            ));
        }
        if self.feature_columns.is_empty() {
            return Err(FusionError::configuration("no feature columns selected"));
        }
        if self.target_columns.is_empty() {
            return Err(FusionError::configuration("no target columns selected"));
        }

        let mut source_names = HashSet::new();
        let mut feature_names = HashSet::new();
        for source in &self.sources {
            if !source_names.insert(source.name.as_str()) {
                return Err(FusionError::configuration(format!(
                    "duplicate source name '{}'",
                    source.name
                )));
            }
            if source.values.columns().is_empty() {
                return Err(FusionError::configuration(format!(
                    "source '{}' selects no value columns",
                    source.name
                )));
            }
            for (label, value) in [
                ("time_tolerance_hours", source.time_tolerance_hours),
                ("spatial_tolerance", source.spatial_tolerance),
            ] {
                if !value.is_finite() || value < 0.0 {
                    return Err(FusionError::configuration(format!(
                        "source '{}' has invalid {}: {}",
                        source.name, label, value
                    )));
                }
            }
            for feature in source.feature_names() {
                if !feature_names.insert(feature.clone()) {
                    return Err(FusionError::configuration(format!(
                        "feature '{}' is produced by more than one source",
                        feature
                    )));
                }
            }
        }

        self.validate_column_names(&feature_names)?;
        self.validate_selection(&feature_names)
    }

    /// Output column names must not collide once the fused table is laid out
    fn validate_column_names(&self, feature_names: &HashSet<String>) -> Result<()> {
        let targets = self.targets.all();
        let mut seen = HashSet::new();
        for target in targets {
            if !seen.insert(target) {
                return Err(FusionError::configuration(format!(
                    "target name '{}' is used twice",
                    target
                )));
            }
        }

        let mut produced: Vec<&str> = self.sources.iter().map(|s| s.name.as_str()).collect();
        produced.extend(feature_names.iter().map(String::as_str));
        produced.extend(targets);

        for name in produced {
            if RESERVED_COLUMNS.contains(&name) || CALENDAR_FEATURES.contains(&name) {
                return Err(FusionError::configuration(format!(
                    "'{}' collides with a built-in column name",
                    name
                )));
            }
            if feature_names.contains(name) && targets.contains(&name) {
                return Err(FusionError::configuration(format!(
                    "feature '{}' collides with a target column",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Every selected feature and target must exist in the fused table
    fn validate_selection(&self, feature_names: &HashSet<String>) -> Result<()> {
        let targets = self.targets.all();
        let is_feature =
            |name: &str| feature_names.contains(name) || CALENDAR_FEATURES.contains(&name);

        for name in &self.feature_columns {
            if !is_feature(name.as_str()) {
                return Err(FusionError::configuration(format!(
                    "feature column '{}' is not produced by any source or calendar feature",
                    name
                )));
            }
        }
        for name in &self.target_columns {
            if !targets.contains(&name.as_str()) && !is_feature(name.as_str()) {
                return Err(FusionError::configuration(format!(
                    "target column '{}' is neither a target nor a fused feature",
                    name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FusionConfig::default();

        config.validate().unwrap();
        assert_eq!(config.sources.len(), 8);
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.target_columns, vec!["pm25", "o3", "aqi"]);
    }

    #[test]
    fn test_default_tolerances_follow_cadence() {
        let config = FusionConfig::default();
        let tolerance = |name: &str| {
            config
                .sources
                .iter()
                .find(|s| s.name == name)
                .map(|s| s.time_tolerance_hours)
                .unwrap()
        };

        assert_eq!(tolerance("tempo_no2"), 2.0);
        assert_eq!(tolerance("modis_aod"), 6.0);
        assert_eq!(tolerance("tropomi_co"), 12.0);
    }

    #[test]
    fn test_feature_layout_expands_multi_column_sources() {
        let layout = FusionConfig::default().feature_layout();

        assert_eq!(layout.len(), 10);
        assert_eq!(&layout[6..9], &["wind_U", "wind_V", "wind_speed"]);
        assert_eq!(layout[9], "precipitation");
    }

    #[test]
    fn test_validate_rejects_negative_tolerance() {
        let mut config = FusionConfig::default();
        config.sources[0].time_tolerance_hours = -1.0;

        assert!(matches!(
            config.validate(),
            Err(FusionError::Configuration { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_features() {
        let config = FusionConfig::default().with_sources(vec![
            SourceConfig::new(
                "a",
                "a.csv",
                FeatureGroup::Weather,
                ValueSelection::Columns(vec!["wind_speed".to_string()]),
            ),
            SourceConfig::new(
                "wind_speed",
                "b.csv",
                FeatureGroup::Weather,
                ValueSelection::Column("speed".to_string()),
            ),
        ]);

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_features_no_source_produces() {
        let config = FusionConfig::default().with_sources(vec![SourceConfig::new(
            "tempo_no2",
            "tempo_no2.csv",
            FeatureGroup::Satellite,
            ValueSelection::Column("no2".to_string()),
        )]);

        let err = config.validate().unwrap_err();

        assert!(matches!(err, FusionError::Configuration { .. }));
        assert!(err.to_string().contains("tempo_ch2o"));
    }

    #[test]
    fn test_validate_accepts_calendar_and_target_selection() {
        let mut config = FusionConfig::default();
        config.feature_columns = vec!["wind_V".to_string(), "hour".to_string()];
        config.target_columns = vec!["aqi".to_string(), "pbl_height".to_string()];

        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unknown_target_column() {
        let mut config = FusionConfig::default();
        config.target_columns = vec!["pm10".to_string()];

        assert!(matches!(
            config.validate(),
            Err(FusionError::Configuration { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_built_in_column_names() {
        let renamed = |name: &str| {
            let mut config = FusionConfig::default();
            config.sources[0].name = name.to_string();
            config.feature_columns[0] = name.to_string();
            config
        };

        for name in ["timestamp", "latitude", "place_name", "hour", "pm25"] {
            assert!(renamed(name).validate().is_err(), "{} accepted", name);
        }

        let mut wind = FusionConfig::default();
        wind.sources[6].values =
            ValueSelection::Columns(vec!["wind_speed".to_string(), "longitude".to_string()]);
        assert!(wind.validate().is_err());

        let mut targets = FusionConfig::default();
        targets.targets.composite_index = "o3".to_string();
        assert!(targets.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = FusionConfig::default().with_max_workers(0);

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{
            "data_dir": "/srv/aq",
            "spatial_policy": "within_tolerance",
            "sources": [
                {"name": "modis_aod", "file": "aod.csv", "group": "satellite",
                 "values": "aod", "time_tolerance_hours": 6.0},
                {"name": "wind", "file": "wind.csv", "group": "weather",
                 "values": ["wind_U", "wind_V"]}
            ]
        }"#;

        let config: FusionConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/srv/aq"));
        assert_eq!(config.spatial_policy, SpatialPolicy::WithinTolerance);
        assert_eq!(config.sources[0].values, ValueSelection::Column("aod".into()));
        assert_eq!(config.sources[1].time_tolerance_hours, 2.0);
        assert_eq!(config.sources[1].spatial_tolerance, 1.0);
        assert_eq!(config.primary.value_column, "ground_pm25");
        assert_eq!(config.feature_layout(), vec!["modis_aod", "wind_U", "wind_V"]);
    }

    #[test]
    fn test_resolve_relative_paths() {
        let config = FusionConfig::default().with_data_dir("/data");

        assert_eq!(
            config.resolve(Path::new("a.csv")),
            PathBuf::from("/data/a.csv")
        );
        assert_eq!(
            config.resolve(Path::new("/abs/b.csv")),
            PathBuf::from("/abs/b.csv")
        );
    }
}
