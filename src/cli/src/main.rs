//! Rollup CLI - Operator tooling for rating aggregates and the review job queue.
//!
//! Provides commands for inspecting aggregates, managing dead-lettered jobs,
//! publishing events and checking configuration.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use commands::{aggregate, config, publish, queue};
use output::OutputFormat;

/// Rollup - incremental aggregate pipeline CLI
#[derive(Parser)]
#[command(
    name = "rollup",
    version,
    about = "Rollup - incremental aggregate pipeline",
    long_about = "Inspect and repair cached aggregates, manage the job queue and publish events.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Configuration file; `ROLLUP__*` environment variables override it
    #[arg(short, long, global = true, env = "ROLLUP_CONFIG")]
    config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cached aggregate operations
    #[command(subcommand)]
    Aggregate(aggregate::AggregateCommands),

    /// Job queue operations
    #[command(subcommand)]
    Queue(queue::QueueCommands),

    /// Publish an event to the broker stream
    Publish(publish::PublishArgs),

    /// Configuration inspection
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let format = cli.output;
    let result = match client::Backends::load(cli.config.as_deref()) {
        Ok(backends) => match cli.command {
            Commands::Aggregate(cmd) => aggregate::execute(cmd, &backends, format).await,
            Commands::Queue(cmd) => queue::execute(cmd, &backends, format).await,
            Commands::Publish(args) => publish::execute(args, &backends, format).await,
            Commands::Config(cmd) => config::execute(cmd, &backends, format).await,
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
