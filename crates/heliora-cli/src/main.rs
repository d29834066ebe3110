//! Heliora CLI - the renewable-energy oracle.
//!
//! Command-line interface for running the oracle and evaluating
//! roulette turns offline.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

/// Heliora: roulette-wheel block-producer selection and
/// vote-participation rewards for a renewable-energy network.
#[derive(Parser)]
#[command(name = "heliora")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path (JSON); environment variables override it
    #[arg(short, long, global = true, env = "HELIORA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the oracle: consumers, baseline scheduler and metrics
    Serve {
        /// Override the metrics listen address
        #[arg(long)]
        metrics_addr: Option<String>,

        /// Override the sled storage directory
        #[arg(long)]
        storage_path: Option<PathBuf>,
    },

    /// Evaluate one roulette turn offline and print the candidate table
    Dryrun {
        /// Contributors file (JSON array of {address, energy_kwh})
        #[arg(short = 'i', long)]
        contributors: PathBuf,

        /// Optional credit map file (JSON object of address -> count)
        #[arg(long)]
        credits: Option<PathBuf>,

        /// Energy vs credit weight
        #[arg(short, long, default_value_t = 0.7)]
        beta: f64,

        /// Seed material for the deterministic draw
        #[arg(short, long, default_value = "dryrun:contributors:0:0")]
        seed: String,
    },
}

/// Initialize logging. Precedence: `HELIORA_LOG`, then `--verbose`,
/// then the configured (or default) filter.
fn init_tracing(verbose: bool, configured: &str) {
    let fallback = if verbose { "debug" } else { configured };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("HELIORA_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            metrics_addr,
            storage_path,
        } => commands::serve::run(cli.config, metrics_addr, storage_path, cli.verbose),
        Commands::Dryrun {
            contributors,
            credits,
            beta,
            seed,
        } => {
            init_tracing(cli.verbose, "info");
            commands::dryrun::run(contributors, credits, beta, seed)
        }
    }
}
