//! Rollup Server - Main entry point
//!
//! Consumes review events and keeps product rating aggregates current.

use clap::Parser;
use std::path::PathBuf;

use rollup_core::{config::Config, pipeline::Pipeline, telemetry};

#[derive(Parser)]
#[command(name = "rollup-server")]
#[command(author, version, about = "Keeps rating aggregates current from review events")]
struct Args {
    /// Configuration file (TOML, YAML or JSON); environment variables override it
    #[arg(short, long, env = "ROLLUP_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = Config::load_from(args.config.as_deref().and_then(|p| p.to_str()))?;

    let telemetry = telemetry::init_telemetry(&config.observability, "rollup-server")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        topic = %config.broker.topic,
        queue = %config.queue.name,
        "Starting Rollup Server"
    );

    let pipeline = Pipeline::connect(config).await?;
    pipeline.run(shutdown_signal()).await;

    tracing::info!("Server shutdown complete");
    telemetry.shutdown();

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
