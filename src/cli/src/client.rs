//! Connections to the stores the pipeline runs against.
//!
//! Each command connects only to what it needs, so `rollup queue stats` works
//! without a reachable database.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use rollup_core::cache::{connect_redis, KeySpace, RedisAggregateCache};
use rollup_core::bridge::RedisStreamProducer;
use rollup_core::config::Config;
use rollup_core::jobs::{JobQueue, RedisQueueBackend, RetryPolicy};
use rollup_core::store::PgAuthoritativeSource;

/// Effective configuration plus lazily opened connections.
pub struct Backends {
    config: Config,
}

impl Backends {
    /// Load configuration from `path` (if any) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(|p| p.to_str().context("Config path is not valid UTF-8"))
            .transpose()?;
        let config = Config::load_from(path).context("Failed to load configuration")?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn cache(&self) -> Result<RedisAggregateCache> {
        let conn = connect_redis(&self.config.redis.url).await?;
        Ok(RedisAggregateCache::new(conn, KeySpace::new(&self.config.cache.key_prefix)))
    }

    pub async fn queue(&self) -> Result<JobQueue> {
        let conn = connect_redis(&self.config.redis.url).await?;
        let backend = RedisQueueBackend::new(
            conn,
            &self.config.queue.key_prefix,
            self.config.queue.dead_letter_max_size,
        );
        Ok(JobQueue::new(
            &self.config.queue.name,
            Arc::new(backend),
            RetryPolicy::from_settings(&self.config.queue),
        ))
    }

    pub async fn source(&self) -> Result<PgAuthoritativeSource> {
        PgAuthoritativeSource::connect(&self.config.database)
            .await
            .context("Failed to connect to the database")
    }

    pub async fn producer(&self) -> Result<RedisStreamProducer> {
        let conn = connect_redis(&self.config.redis.url).await?;
        Ok(RedisStreamProducer::new(conn, &self.config.broker.topic))
    }
}
