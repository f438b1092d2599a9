//! Command-line argument definitions for the fusion engine
//!
//! Every subcommand shares the same data and fusion options; flags override
//! values from the configuration file, which override the defaults.

use crate::config::{FusionConfig, IncompletePolicy, SpatialPolicy};
use crate::error::{FusionError, Result};
use crate::writer::{CompressionAlgorithm, OutputFormat};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};

/// Upper bound accepted for `--workers`
pub const MAX_WORKERS_LIMIT: usize = 256;

/// CLI arguments for the air quality fusion engine
///
/// Aligns ground-sensor pollutant readings with the nearest satellite and
/// weather measurements, then prepares and fits regression models on the
/// fused table.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "aq-fusion",
    version,
    about = "Fuse ground, satellite and weather air quality data into model-ready tables"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Load all datasets, fuse them and write the fused table
    Fuse(FuseArgs),
    /// Fuse, then write imputed feature and target matrices
    Prepare(FuseArgs),
    /// Fuse, prepare and fit the baseline model, reporting metrics
    Train(TrainArgs),
}

/// Options shared by every subcommand
#[derive(Debug, Clone, ClapArgs)]
pub struct FuseArgs {
    /// JSON configuration file
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Directory containing the input CSV files
    #[arg(short = 'i', long = "data-dir", value_name = "PATH")]
    pub data_dir: Option<PathBuf>,

    /// Output directory
    #[arg(
        short = 'o',
        long = "output",
        value_name = "PATH",
        default_value = "output"
    )]
    pub output_path: PathBuf,

    /// Output file format
    #[arg(long = "format", value_enum, default_value_t = OutputFormat::Parquet)]
    pub format: OutputFormat,

    /// Parquet compression algorithm
    #[arg(long = "compression", value_enum, default_value_t = CompressionAlgorithm::Snappy)]
    pub compression: CompressionAlgorithm,

    /// Maximum number of fusion workers (also capped by available cores)
    #[arg(short = 'j', long = "workers", value_name = "COUNT")]
    pub workers: Option<usize>,

    /// Run the fusion on the calling thread only
    #[arg(long = "sequential")]
    pub sequential: bool,

    /// Treat matches beyond a source's spatial tolerance as missing
    #[arg(long = "strict-spatial")]
    pub strict_spatial: bool,

    /// Drop fused rows with any missing feature instead of imputing
    #[arg(long = "drop-incomplete")]
    pub drop_incomplete: bool,

    /// Increase logging verbosity (-v: debug, -vv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only show warnings and errors
    #[arg(short = 'q', long = "quiet", conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Debug, Clone, ClapArgs)]
pub struct TrainArgs {
    #[command(flatten)]
    pub fuse: FuseArgs,

    /// L2 penalty of the ridge baseline
    #[arg(long = "alpha", default_value_t = crate::predictor::DEFAULT_RIDGE_ALPHA)]
    pub alpha: f64,
}

impl Args {
    /// Options shared by the selected subcommand
    pub fn fuse_args(&self) -> Option<&FuseArgs> {
        match self.command.as_ref()? {
            Commands::Fuse(args) | Commands::Prepare(args) => Some(args),
            Commands::Train(args) => Some(&args.fuse),
        }
    }
}

impl FuseArgs {
    pub fn get_log_level(&self) -> &'static str {
        if self.quiet {
            "warn"
        } else {
            match self.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }

    pub fn show_progress(&self) -> bool {
        !self.quiet
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(data_dir) = &self.data_dir {
            if !data_dir.is_dir() {
                return Err(FusionError::configuration(format!(
                    "Data directory does not exist: {}",
                    data_dir.display()
                )));
            }
        }

        if let Some(workers) = self.workers {
            if workers == 0 {
                return Err(FusionError::configuration(
                    "Number of workers must be greater than 0",
                ));
            }
            if workers > MAX_WORKERS_LIMIT {
                return Err(FusionError::configuration(format!(
                    "Number of workers cannot exceed {}",
                    MAX_WORKERS_LIMIT
                )));
            }
        }

        Ok(())
    }

    /// Apply flag overrides on top of a loaded configuration
    pub fn apply_overrides(&self, mut config: FusionConfig) -> FusionConfig {
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(workers) = self.workers {
            config.max_workers = workers;
        }
        if self.strict_spatial {
            config.spatial_policy = SpatialPolicy::WithinTolerance;
        }
        if self.drop_incomplete {
            config.incomplete_policy = IncompletePolicy::DropAnyMissing;
        }
        config
    }

    pub fn fused_output_path(&self) -> PathBuf {
        self.output_path
            .join(format!("fused.{}", self.format.extension()))
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_fuse_defaults() {
        let args = parse(&["aq-fusion", "fuse"]);
        let fuse = args.fuse_args().unwrap();

        assert_eq!(fuse.format, OutputFormat::Parquet);
        assert_eq!(fuse.output_path, PathBuf::from("output"));
        assert_eq!(fuse.get_log_level(), "info");
        assert!(fuse.workers.is_none());
        assert_eq!(fuse.fused_output_path(), PathBuf::from("output/fused.parquet"));
    }

    #[test]
    fn test_overrides_apply_to_config() {
        let args = parse(&[
            "aq-fusion",
            "prepare",
            "--workers",
            "2",
            "--strict-spatial",
            "--drop-incomplete",
            "--format",
            "csv",
            "-vv",
        ]);
        let fuse = args.fuse_args().unwrap();

        let config = fuse.apply_overrides(FusionConfig::default());

        assert_eq!(config.max_workers, 2);
        assert_eq!(config.spatial_policy, SpatialPolicy::WithinTolerance);
        assert_eq!(config.incomplete_policy, IncompletePolicy::DropAnyMissing);
        assert_eq!(fuse.format, OutputFormat::Csv);
        assert_eq!(fuse.get_log_level(), "trace");
    }

    #[test]
    fn test_train_flattens_fuse_options() {
        let args = parse(&["aq-fusion", "train", "--alpha", "0.5", "--sequential", "-q"]);

        let Some(Commands::Train(train)) = &args.command else {
            panic!("expected train command");
        };
        assert_eq!(train.alpha, 0.5);
        assert!(train.fuse.sequential);
        assert_eq!(train.fuse.get_log_level(), "warn");
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Args::try_parse_from(["aq-fusion", "fuse", "-q", "-v"]).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let args = parse(&["aq-fusion", "fuse", "--workers", "0"]);

        assert!(args.fuse_args().unwrap().validate().is_err());
    }
}
