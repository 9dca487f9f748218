//! `vision-cot`: train, generate and inspect vision-token reasoning
//! compression from the command line.
//!
//! Logs go to stderr (`RUST_LOG`, default `info`) so `--json` output on
//! stdout stays machine-readable.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::{
    check_config::CheckConfigArgs, generate::GenerateArgs, stats::StatsArgs, train::TrainArgs,
};

#[derive(Parser)]
#[command(name = "vision-cot", version, about = "Vision-token reasoning compression")]
struct Cli {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the active stage on a JSONL dataset
    Train(TrainArgs),
    /// Generate an answer through soft tokens
    Generate(GenerateArgs),
    /// Compare text tokens with vision tokens for a reasoning trace
    Stats(StatsArgs),
    /// Validate configuration and show the stage assignment
    CheckConfig(CheckConfigArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config;
    let code = match cli.command {
        Commands::Train(args) => commands::train::handle_train(config, args).await,
        Commands::Generate(args) => commands::generate::handle_generate(config, args).await,
        Commands::Stats(args) => commands::stats::handle_stats(config, args).await,
        Commands::CheckConfig(args) => commands::check_config::handle_check_config(config, args),
    };
    std::process::exit(code);
}
