//! Job worker for concurrent job execution.

use metrics::{gauge, histogram};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::{JobError, JobHandler, JobQueue, JobStatus, QueuedJob};
use crate::config::WorkerSettings;

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent job executions
    pub concurrency: usize,
    /// Poll interval for checking the queue when it is empty
    pub poll_interval: Duration,
    /// A handler running longer than this fails with a retryable error
    pub handler_timeout: Duration,
    /// How long shutdown waits for in-flight jobs
    pub shutdown_timeout: Duration,
    /// How often delayed jobs are promoted
    pub promote_interval: Duration,
    /// Worker name; identifies the claimed-jobs list, so keep it stable across restarts
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_settings(&WorkerSettings::default(), "rollup-worker")
    }
}

impl WorkerConfig {
    pub fn from_settings(settings: &WorkerSettings, name: impl Into<String>) -> Self {
        Self {
            concurrency: settings.concurrency.max(1),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            handler_timeout: Duration::from_secs(settings.handler_timeout_secs),
            shutdown_timeout: Duration::from_secs(settings.shutdown_timeout_secs),
            promote_interval: Duration::from_millis(settings.promote_interval_ms),
            name: name.into(),
        }
    }
}

/// Statistics for the job worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Total handler executions
    pub processed: Arc<AtomicU64>,
    /// Executions that completed the job
    pub succeeded: Arc<AtomicU64>,
    /// Executions that scheduled a retry
    pub retried: Arc<AtomicU64>,
    /// Executions that dead-lettered the job
    pub dead: Arc<AtomicU64>,
    /// Currently running jobs
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn dead(&self) -> u64 {
        self.dead.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown: tokio::sync::watch::Sender<bool>,
    stats: WorkerStats,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Signal shutdown and wait for the dispatch loop to drain.
    pub async fn stop(self) {
        self.shutdown();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }
}

/// Job worker that processes jobs from a queue.
pub struct JobWorker {
    config: WorkerConfig,
    stats: WorkerStats,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            stats: WorkerStats::new(),
        }
    }

    /// Start the worker, returning a handle for control.
    ///
    /// Jobs this worker left claimed in a previous run are requeued first.
    pub fn start(self, queue: Arc<JobQueue>, handler: Arc<dyn JobHandler>) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
        let stats = self.stats.clone();
        let config = self.config;
        let loop_stats = stats.clone();

        let task = tokio::spawn(async move {
            let stats = loop_stats;
            let semaphore = Arc::new(Semaphore::new(config.concurrency));
            let mut last_promote = Instant::now();

            if let Err(e) = queue.recover_stalled(&config.name).await {
                tracing::error!(worker = %config.name, error = %e, "Stalled job recovery failed");
            }

            tracing::info!(
                worker = %config.name,
                queue = %queue.name(),
                concurrency = config.concurrency,
                "Job worker started"
            );

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                if last_promote.elapsed() >= config.promote_interval {
                    last_promote = Instant::now();
                    if let Err(e) = queue.promote_due().await {
                        tracing::warn!(worker = %config.name, error = %e, "Promoting delayed jobs failed");
                    }
                }

                let permit = tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let job = match queue.claim(&config.name).await {
                    Ok(Some(job)) => job,
                    Ok(None) => {
                        drop(permit);
                        Self::idle(&mut shutdown_rx, config.poll_interval).await;
                        continue;
                    }
                    Err(e) => {
                        drop(permit);
                        tracing::warn!(worker = %config.name, error = %e, "Claiming job failed");
                        Self::idle(&mut shutdown_rx, config.poll_interval).await;
                        continue;
                    }
                };

                let queue = queue.clone();
                let handler = handler.clone();
                let stats = stats.clone();
                let worker = config.name.clone();
                let timeout = config.handler_timeout;

                tokio::spawn(async move {
                    stats.active.fetch_add(1, Ordering::Relaxed);
                    gauge!("rollup_worker_active_jobs", "worker" => worker.clone())
                        .set(stats.active() as f64);

                    Self::execute(&queue, handler.as_ref(), &stats, &worker, job, timeout).await;

                    stats.active.fetch_sub(1, Ordering::Relaxed);
                    gauge!("rollup_worker_active_jobs", "worker" => worker.clone())
                        .set(stats.active() as f64);
                    drop(permit);
                });
            }

            tracing::info!(worker = %config.name, "Worker shutting down, draining in-flight jobs");
            let drained = tokio::time::timeout(
                config.shutdown_timeout,
                semaphore.acquire_many(config.concurrency as u32),
            )
            .await;
            match drained {
                Ok(_) => tracing::info!(worker = %config.name, "Worker stopped"),
                Err(_) => tracing::warn!(
                    worker = %config.name,
                    active = stats.active(),
                    "Shutdown timeout reached with jobs still running"
                ),
            }
        });

        WorkerHandle {
            shutdown: shutdown_tx,
            stats,
            task,
        }
    }

    async fn idle(shutdown_rx: &mut tokio::sync::watch::Receiver<bool>, interval: Duration) {
        tokio::select! {
            _ = shutdown_rx.changed() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }

    /// Run one delivery of `job` and settle it with the queue.
    async fn execute(
        queue: &JobQueue,
        handler: &dyn JobHandler,
        stats: &WorkerStats,
        worker: &str,
        job: QueuedJob,
        timeout: Duration,
    ) {
        let span = tracing::info_span!(
            "job",
            job_id = %job.id(),
            job_name = %job.name(),
            attempt = job.metadata.attempts,
            worker = worker,
        );

        async {
            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, handler.handle(&job)).await {
                Ok(result) => result,
                Err(elapsed) => Err(JobError::from(elapsed)),
            };
            histogram!("rollup_job_duration_seconds", "job" => job.name().to_string())
                .record(started.elapsed().as_secs_f64());
            stats.processed.fetch_add(1, Ordering::Relaxed);

            let settled = match result {
                Ok(()) => {
                    stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Job completed");
                    queue.complete(worker, &job).await
                }
                Err(error) => match queue.fail(worker, &job, &error).await {
                    Ok(JobStatus::Dead) => {
                        stats.dead.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Ok(_) => {
                        stats.retried.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
            };

            // The job stays claimed and is requeued by the next recover_stalled.
            if let Err(e) = settled {
                tracing::error!(error = %e, "Failed to record job outcome");
            }
        }
        .instrument(span)
        .await
    }
}
