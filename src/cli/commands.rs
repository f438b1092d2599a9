//! Command implementations for the fusion CLI
//!
//! Each command runs the same load → fuse pipeline and then writes the
//! fused table, the prepared matrices, or a model evaluation report.

use crate::assembler::FusionInputs;
use crate::cli::args::{Args, Commands, FuseArgs, TrainArgs};
use crate::config::FusionConfig;
use crate::driver::FusionDriver;
use crate::error::{FusionError, Result};
use crate::features::FeaturePreparer;
use crate::loader;
use crate::models::{ExecutionMode, FusedTable, FusionStats};
use crate::predictor::{AirQualityPredictor, TOP_FEATURES, TrainingReport};
use crate::writer::TableWriter;
use colored::*;
use indicatif::HumanDuration;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// What a command run produced, for the final summary
#[derive(Debug, Clone, Default)]
pub struct CommandSummary {
    pub fusion: FusionStats,
    pub outputs: Vec<(String, u64)>,
    pub training: Option<TrainingReport>,
    pub elapsed: Duration,
}

impl CommandSummary {
    /// Format output size in human-readable format
    pub fn format_size(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        if unit_index == 0 {
            format!("{} {}", bytes, UNITS[unit_index])
        } else {
            format!("{:.2} {}", size, UNITS[unit_index])
        }
    }
}

/// Run the selected subcommand
pub async fn run(args: Args) -> Result<CommandSummary> {
    let command = args
        .command
        .ok_or_else(|| FusionError::configuration("no command given"))?;

    let summary = match command {
        Commands::Fuse(fuse) => run_fuse(fuse).await?,
        Commands::Prepare(fuse) => run_prepare(fuse).await?,
        Commands::Train(train) => run_train(train).await?,
    };

    print_summary(&summary);
    Ok(summary)
}

/// Set up structured logging
pub fn setup_logging(args: &FuseArgs) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let log_level = args.get_log_level();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("aq_fusion={}", log_level)));

    let result = if args.quiet {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_level(true)
                    .with_writer(std::io::stderr)
                    .compact(),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_level(true)
                    .with_timer(fmt::time::uptime())
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };
    result.map_err(|e| FusionError::configuration(format!("failed to initialise logging: {}", e)))?;

    debug!("Logging initialized at level: {}", log_level);
    Ok(())
}

/// Layered configuration: defaults, then the JSON file, then flags
pub fn load_configuration(args: &FuseArgs) -> Result<FusionConfig> {
    let config = match &args.config_file {
        Some(path) => {
            info!("Using config file: {}", path.display());
            FusionConfig::from_file(path)?
        }
        None => {
            info!("No config file given, using defaults");
            FusionConfig::default()
        }
    };

    let config = args.apply_overrides(config);
    config.validate()?;
    Ok(config)
}

/// Load every dataset and fuse them
pub async fn fuse(args: &FuseArgs, config: &FusionConfig) -> Result<(FusedTable, FusionStats)> {
    println!("{}", "Loading datasets...".bright_yellow());
    let loaded = loader::load_all(config).await?;
    println!(
        "  {} {} ground-truth rows, {} auxiliary sources",
        "Loaded".bright_green(),
        loaded.primary.len().to_string().bright_white().bold(),
        loaded.sources.len().to_string().bright_white().bold()
    );

    let inputs = FusionInputs::new(config, loaded.primary, &loaded.co_pollutant, loaded.sources)?;

    let mode = if args.sequential {
        ExecutionMode::Sequential
    } else {
        ExecutionMode::Parallel
    };
    let driver = FusionDriver::new(config.max_workers)
        .with_mode(mode)
        .with_progress(args.show_progress());

    println!("\n{}", "Fusing observations...".bright_yellow());
    tokio::task::spawn_blocking(move || driver.run(&inputs))
        .await
        .map_err(|e| FusionError::WorkerPool {
            reason: format!("fusion task failed: {}", e),
        })?
}

async fn run_fuse(args: FuseArgs) -> Result<CommandSummary> {
    let start = Instant::now();
    setup_logging(&args)?;
    args.validate()?;
    let config = load_configuration(&args)?;

    let (table, fusion) = fuse(&args, &config).await?;

    let writer = TableWriter::new(args.format).with_compression(args.compression);
    let path = args.fused_output_path();
    writer.write_fused(&table, &path)?;
    let size = std::fs::metadata(&path)?.len();

    Ok(CommandSummary {
        fusion,
        outputs: vec![(path.display().to_string(), size)],
        training: None,
        elapsed: start.elapsed(),
    })
}

async fn run_prepare(args: FuseArgs) -> Result<CommandSummary> {
    let start = Instant::now();
    setup_logging(&args)?;
    args.validate()?;
    let config = load_configuration(&args)?;

    let (table, fusion) = fuse(&args, &config).await?;
    let prepared = FeaturePreparer::from_config(&config).prepare(&table)?;

    let writer = TableWriter::new(args.format).with_compression(args.compression);
    let (features, targets) = writer.write_prepared(&prepared, args.output_dir())?;

    let mut outputs = Vec::new();
    for path in [features, targets] {
        let size = std::fs::metadata(&path)?.len();
        outputs.push((path.display().to_string(), size));
    }

    Ok(CommandSummary {
        fusion,
        outputs,
        training: None,
        elapsed: start.elapsed(),
    })
}

async fn run_train(args: TrainArgs) -> Result<CommandSummary> {
    let start = Instant::now();
    let fuse_args = &args.fuse;
    setup_logging(fuse_args)?;
    fuse_args.validate()?;
    let config = load_configuration(fuse_args)?;

    let (table, fusion) = fuse(fuse_args, &config).await?;
    let prepared = FeaturePreparer::from_config(&config).prepare(&table)?;

    println!("\n{}", "Training baseline model...".bright_yellow());
    let (_, report) =
        AirQualityPredictor::train_ridge(&prepared, config.targets.clone(), args.alpha)?;

    Ok(CommandSummary {
        fusion,
        outputs: Vec::new(),
        training: Some(report),
        elapsed: start.elapsed(),
    })
}

fn print_summary(summary: &CommandSummary) {
    let stats = &summary.fusion;

    println!("\n{}", "Fusion Summary".bright_green().bold());
    println!(
        "  {} {}",
        "Ground-truth rows:".bright_cyan(),
        stats.ground_truth_rows.to_string().bright_white()
    );
    println!(
        "  {} {}",
        "Fused rows:".bright_cyan(),
        stats.fused_rows.to_string().bright_white().bold()
    );
    if stats.dropped_rows() > 0 {
        println!(
            "  {} {} ({} without co-pollutant, {} without a value, {} incomplete)",
            "Dropped rows:".bright_red(),
            stats.dropped_rows().to_string().bright_red().bold(),
            stats.dropped_missing_co_pollutant,
            stats.dropped_missing_primary,
            stats.dropped_incomplete
        );
    }
    println!(
        "  {} {} chunks, {}",
        "Execution:".bright_cyan(),
        stats.chunks,
        stats.mode
    );

    if let Some(report) = &summary.training {
        println!("\n{}", "Model Performance".bright_green().bold());
        for split in &report.splits {
            println!(
                "  {} ({} rows)",
                split.split.to_string().bright_cyan(),
                split.rows
            );
            for (target, m) in &split.metrics {
                println!(
                    "    {:6} R² = {:.3}, RMSE = {:.2}, MAE = {:.2}",
                    target.to_uppercase(),
                    m.r2,
                    m.rmse,
                    m.mae
                );
            }
        }

        if !report.importances.is_empty() {
            println!("\n{}", "Top Features".bright_green().bold());
            for importance in &report.importances {
                let ranked: Vec<String> = importance
                    .top(TOP_FEATURES)
                    .iter()
                    .map(|(name, weight)| format!("{} ({:+.3})", name, weight))
                    .collect();
                println!(
                    "  {:6} {}",
                    importance.target.to_uppercase().bright_cyan(),
                    ranked.join(", ")
                );
            }
        }
    }

    if !summary.outputs.is_empty() {
        println!("\n{}", "Output Files".bright_green().bold());
        for (path, size) in &summary.outputs {
            println!("  {} {}", path, CommandSummary::format_size(*size));
        }
    }

    println!(
        "\n  {} {}",
        "Time elapsed:".bright_cyan(),
        HumanDuration(summary.elapsed)
    );
}
