//! Wires the bridge, queue, updater and stores together.
//!
//! ```text
//! broker ──▶ IngestionBridge ──▶ JobQueue ──▶ JobWorker ──▶ AggregateUpdater ──▶ cache
//!                                                                   │
//!                                                                   └─(cold)─▶ database
//! ```

use sqlx::PgPool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregate::{AggregateUpdater, EventNames};
use crate::bridge::{BridgeStats, BrokerConsumer, IngestionBridge, RedisStreamConsumer};
use crate::cache::{connect_redis, KeySpace, RedisAggregateCache};
use crate::config::Config;
use crate::error::Result;
use crate::jobs::{JobQueue, JobWorker, RedisQueueBackend, RetryPolicy, WorkerConfig, WorkerHandle, WorkerStats};
use crate::store::PgAuthoritativeSource;

/// A fully constructed, not yet running pipeline.
pub struct Pipeline {
    config: Config,
    queue: Arc<JobQueue>,
    updater: Arc<AggregateUpdater>,
    consumer: Box<dyn BrokerConsumer>,
    pool: Option<PgPool>,
}

impl Pipeline {
    /// Assemble a pipeline from already constructed parts.
    pub fn new(
        config: Config,
        queue: Arc<JobQueue>,
        updater: Arc<AggregateUpdater>,
        consumer: Box<dyn BrokerConsumer>,
    ) -> Self {
        Self {
            config,
            queue,
            updater,
            consumer,
            pool: None,
        }
    }

    /// Close `pool` once the workers have drained on shutdown.
    pub fn with_database_pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Connect to Redis and PostgreSQL and build the production pipeline.
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate()?;

        let redis = connect_redis(&config.redis.url).await?;
        // Blocking stream reads get their own connection.
        let broker_conn = connect_redis(&config.redis.url).await?;
        let source = PgAuthoritativeSource::connect(&config.database).await?;
        let pool = source.pool().clone();

        let cache = RedisAggregateCache::new(redis.clone(), KeySpace::new(&config.cache.key_prefix));
        let backend = RedisQueueBackend::new(
            redis,
            &config.queue.key_prefix,
            config.queue.dead_letter_max_size,
        );
        let queue = JobQueue::new(
            &config.queue.name,
            Arc::new(backend),
            RetryPolicy::from_settings(&config.queue),
        );
        let updater = AggregateUpdater::new(
            Arc::new(cache),
            Arc::new(source),
            EventNames::from(&config.broker.events),
        )
        .with_max_cas_retries(config.updater.max_cas_retries);
        let consumer = RedisStreamConsumer::connect(broker_conn, &config.broker).await?;

        Ok(Self::new(
            config,
            Arc::new(queue),
            Arc::new(updater),
            Box::new(consumer),
        )
        .with_database_pool(pool))
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Spawn the worker pool and the bridge loop.
    pub fn start(self) -> RunningPipeline {
        let worker_config = WorkerConfig::from_settings(
            &self.config.worker,
            format!("{}-worker", self.config.broker.consumer),
        );
        let worker = JobWorker::new(worker_config).start(self.queue.clone(), self.updater.clone());

        let shutdown = CancellationToken::new();
        let bridge = IngestionBridge::new(
            self.consumer,
            self.queue.clone(),
            self.updater.names().clone(),
        )
        .with_reconnect_backoff(self.config.broker.reconnect_backoff());
        let bridge_stats = bridge.stats();
        let bridge = tokio::spawn(bridge.run(shutdown.clone()));

        tracing::info!(
            topic = %self.config.broker.topic,
            queue = %self.queue.name(),
            concurrency = self.config.worker.concurrency,
            "Pipeline started"
        );

        RunningPipeline {
            shutdown,
            bridge,
            bridge_stats,
            worker,
            queue: self.queue,
            pool: self.pool,
            shutdown_timeout: Duration::from_secs(self.config.worker.shutdown_timeout_secs),
        }
    }

    /// Run until `signal` resolves, then shut down gracefully.
    pub async fn run(self, signal: impl Future<Output = ()>) {
        let running = self.start();
        signal.await;
        running.shutdown().await;
    }
}

/// Handle to a started pipeline.
pub struct RunningPipeline {
    shutdown: CancellationToken,
    bridge: JoinHandle<BridgeStats>,
    bridge_stats: BridgeStats,
    worker: WorkerHandle,
    queue: Arc<JobQueue>,
    pool: Option<PgPool>,
    shutdown_timeout: Duration,
}

impl RunningPipeline {
    pub fn bridge_stats(&self) -> &BridgeStats {
        &self.bridge_stats
    }

    pub fn worker_stats(&self) -> &WorkerStats {
        self.worker.stats()
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Stop reading from the broker, drain the workers, then close the
    /// database pool. Redis connections close when the last handle drops.
    pub async fn shutdown(self) {
        tracing::info!("Pipeline shutting down");
        self.shutdown.cancel();

        match tokio::time::timeout(self.shutdown_timeout, self.bridge).await {
            Ok(Ok(stats)) => tracing::info!(
                received = stats.received(),
                enqueued = stats.enqueued(),
                errors = stats.errors(),
                "Bridge stopped"
            ),
            Ok(Err(e)) => tracing::error!(error = %e, "Bridge task failed"),
            Err(_) => tracing::warn!("Bridge did not stop in time"),
        }

        let stats = self.worker.stats().clone();
        self.worker.stop().await;
        tracing::info!(
            processed = stats.processed(),
            succeeded = stats.succeeded(),
            retried = stats.retried(),
            dead = stats.dead(),
            "Pipeline stopped"
        );

        if let Some(pool) = self.pool {
            pool.close().await;
            tracing::info!("Database pool closed");
        }
    }
}
