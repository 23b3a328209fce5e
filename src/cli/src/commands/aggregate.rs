//! Cached aggregate commands.
//!
//! Provides show and recompute operations for one entity's aggregate.

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use rollup_core::aggregate::{AggregateRecord, EntityId};
use rollup_core::cache::{AggregateCache, CacheLookup};
use rollup_core::store::AuthoritativeSource;

use crate::client::Backends;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum AggregateCommands {
    /// Show the cached aggregate for an entity
    Show {
        /// Entity ID (e.g. product ID)
        entity: EntityId,
    },

    /// Recompute an entity's aggregate from the database
    Recompute {
        /// Entity ID (e.g. product ID)
        entity: EntityId,

        /// Overwrite the cached aggregate with the recomputed one
        #[arg(long)]
        reseed: bool,
    },
}

#[derive(Debug, Serialize, Tabled)]
struct AggregateRow {
    #[tabled(rename = "Entity")]
    entity: i64,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Mean")]
    mean: String,
    #[tabled(rename = "Count")]
    count: u64,
    #[tabled(rename = "Version")]
    version: String,
}

impl AggregateRow {
    fn new(entity: EntityId, source: &str, record: AggregateRecord, version: Option<u64>) -> Self {
        Self {
            entity: entity.0,
            source: source.to_string(),
            mean: format!("{:.4}", record.mean),
            count: record.count,
            version: version.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
        }
    }
}

pub async fn execute(cmd: AggregateCommands, backends: &Backends, format: OutputFormat) -> Result<()> {
    match cmd {
        AggregateCommands::Show { entity } => {
            let cache = backends.cache().await?;
            match cache.get(entity).await? {
                CacheLookup::Hit(cached) => {
                    let row = AggregateRow::new(entity, "cache", cached.record, Some(cached.version));
                    output::print_list(&[row], format);
                }
                CacheLookup::Miss => match format {
                    OutputFormat::Table => {
                        output::print_info(&format!("No cached aggregate for entity {}", entity));
                    }
                    _ => output::print_item(
                        &serde_json::json!({ "entity": entity.0, "cached": false }),
                        format,
                    ),
                },
            }
        }

        AggregateCommands::Recompute { entity, reseed } => {
            let source = backends.source().await?;
            let record = source.recompute(entity).await?;

            let version = if reseed {
                let cache = backends.cache().await?;
                Some(cache.set(entity, record).await?)
            } else {
                None
            };

            output::print_list(&[AggregateRow::new(entity, "database", record, version)], format);
            if let (Some(version), OutputFormat::Table) = (version, format) {
                output::print_success(&format!(
                    "Cache reseeded for entity {} at version {}",
                    entity, version
                ));
            }
        }
    }

    Ok(())
}
