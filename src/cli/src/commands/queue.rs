//! Job queue commands.
//!
//! Provides stats, dead-letter listing and replay.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;
use uuid::Uuid;

use rollup_core::jobs::{JobId, QueuedJob};

use crate::client::Backends;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Show queue counters
    Stats,

    /// List dead-lettered jobs, newest first
    Dead {
        /// Maximum number of results
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Send a dead-lettered job through the queue again
    Replay {
        /// Job ID
        job_id: Uuid,
    },
}

#[derive(Debug, Serialize, Tabled)]
struct DeadJobRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Event")]
    name: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Failed At")]
    failed_at: String,
    #[tabled(rename = "Last Error")]
    last_error: String,
    #[tabled(skip)]
    payload: serde_json::Value,
}

impl From<QueuedJob> for DeadJobRow {
    fn from(job: QueuedJob) -> Self {
        Self {
            id: job.id().to_string(),
            name: job.name().to_string(),
            attempts: job.metadata.attempts,
            failed_at: job
                .metadata
                .finished_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default(),
            last_error: job.metadata.last_error.clone().unwrap_or_default(),
            payload: job.payload,
        }
    }
}

pub async fn execute(cmd: QueueCommands, backends: &Backends, format: OutputFormat) -> Result<()> {
    let queue = backends.queue().await?;

    match cmd {
        QueueCommands::Stats => {
            let stats = queue.stats().await?;
            match format {
                OutputFormat::Table => {
                    output::print_header(&format!("Queue {}", queue.name()));
                    output::print_detail("Waiting", &stats.waiting.to_string());
                    output::print_detail("Delayed", &stats.delayed.to_string());
                    output::print_detail("Processing", &stats.processing.to_string());
                    output::print_detail("Dead", &stats.dead.to_string());
                    output::print_detail("Completed", &stats.completed.to_string());
                    output::print_detail("Failed", &stats.failed.to_string());
                }
                _ => output::print_item(&stats, format),
            }
        }

        QueueCommands::Dead { limit } => {
            let rows: Vec<DeadJobRow> = queue
                .dead_letters(limit)
                .await?
                .into_iter()
                .map(DeadJobRow::from)
                .collect();
            output::print_list(&rows, format);
        }

        QueueCommands::Replay { job_id } => {
            let id = JobId::from(job_id);
            queue
                .replay_dead(id)
                .await
                .with_context(|| format!("Failed to replay job {}", id))?;

            match format {
                OutputFormat::Table => output::print_success(&format!("Job {} moved back to waiting", id)),
                _ => output::print_item(&serde_json::json!({ "job_id": id.to_string(), "replayed": true }), format),
            }
        }
    }

    Ok(())
}
