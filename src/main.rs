use anyhow::{Context, anyhow};
use aq_fusion::cli::{args::Args, commands};
use clap::Parser;
use std::process;

fn main() {
    let args = Args::parse();

    // If no subcommand was provided, show help and available commands
    if args.command.is_none() {
        show_help_and_commands();
        process::exit(0);
    }

    let runtime = tokio::runtime::Runtime::new().unwrap_or_else(|e| {
        eprintln!("Failed to create async runtime: {}", e);
        process::exit(1);
    });

    let result: anyhow::Result<()> = runtime.block_on(async {
        tokio::select! {
            result = commands::run(args) => result.map(|_| ()).context("fusion run failed"),
            signal = tokio::signal::ctrl_c() => {
                eprintln!("\nReceived CTRL+C, shutting down...");
                match signal {
                    Ok(()) => Err(anyhow!("interrupted by user")),
                    Err(e) => Err(e).context("failed to listen for CTRL+C"),
                }
            }
        }
    });

    if let Err(error) = result {
        eprintln!("Error: {:#}", error);
        process::exit(1);
    }
}

/// Show help information and available commands when no subcommand is provided
fn show_help_and_commands() {
    println!("AQ Fusion - Air Quality Spatiotemporal Fusion Engine");
    println!("====================================================");
    println!();
    println!("Align ground-sensor PM2.5 and O3 readings with the nearest satellite");
    println!("retrievals and weather reanalysis values, then prepare model-ready tables.");
    println!();
    println!("USAGE:");
    println!("    aq-fusion <COMMAND> [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    fuse        Fuse all datasets and write the fused table");
    println!("    prepare     Fuse, impute and write feature/target matrices");
    println!("    train       Fuse, prepare and evaluate the ridge baseline");
    println!("    help        Show this help message or help for specific commands");
    println!();
    println!("EXAMPLES:");
    println!("    # Fuse the default datasets found in ./data:");
    println!("    aq-fusion fuse");
    println!();
    println!("    # Use a config file and write CSV output:");
    println!("    aq-fusion fuse --config fusion.json --format csv --output out");
    println!();
    println!("    # Only accept satellite matches within each source's tolerance:");
    println!("    aq-fusion train --strict-spatial --alpha 0.5");
    println!();
    println!("For detailed help on any command, use:");
    println!("    aq-fusion <COMMAND> --help");
}
