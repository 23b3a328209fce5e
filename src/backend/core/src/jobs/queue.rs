//! Durable job queue with delayed retries and dead letter handling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{JobError, JobId, JobMetadata, JobStatus, RetryDecision, RetryPolicy};
use crate::error::{ErrorCode, Result, RollupError};

/// A job in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    /// Job metadata
    pub metadata: JobMetadata,
    /// Decoded event payload
    pub payload: serde_json::Value,
    /// When the job was enqueued
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn new(metadata: JobMetadata, payload: serde_json::Value) -> Self {
        Self {
            metadata,
            payload,
            enqueued_at: Utc::now(),
        }
    }

    pub fn id(&self) -> JobId {
        self.metadata.id
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs ready to be claimed
    pub waiting: usize,
    /// Jobs waiting for their retry backoff
    pub delayed: usize,
    /// Jobs claimed by a worker
    pub processing: usize,
    /// Jobs in the dead-letter list
    pub dead: usize,
    /// Jobs completed (total)
    pub completed: u64,
    /// Jobs dead-lettered (total)
    pub failed: u64,
}

/// Trait for queue backends.
///
/// A backend only moves jobs between states; the retry policy lives in
/// [`JobQueue`]. A claimed job stays recorded under the claiming worker until
/// it is completed, rescheduled or dead-lettered, so a crashed worker's jobs
/// can be recovered.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Persist a job and make it claimable.
    async fn enqueue(&self, job: QueuedJob) -> Result<()>;

    /// Claim the oldest waiting job for `worker`, counting one delivery.
    async fn claim(&self, worker: &str) -> Result<Option<QueuedJob>>;

    /// Acknowledge a job and forget it.
    async fn complete(&self, worker: &str, job: &QueuedJob) -> Result<()>;

    /// Park a job until `ready_at`.
    async fn schedule_retry(&self, worker: &str, job: &QueuedJob, ready_at: DateTime<Utc>) -> Result<()>;

    /// Move a job to the dead-letter list.
    async fn dead_letter(&self, worker: &str, job: &QueuedJob) -> Result<()>;

    /// Move every delayed job due at `now` back to waiting. Returns how many moved.
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Return jobs left claimed by a previous run of `worker` to waiting.
    async fn recover_stalled(&self, worker: &str) -> Result<usize>;

    /// Most recently dead-lettered jobs, newest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueuedJob>>;

    /// Move a dead job back to waiting. Returns false if it is not dead-lettered.
    async fn replay_dead(&self, id: JobId) -> Result<bool>;

    /// Look up a job that is still owned by the queue.
    async fn get(&self, id: JobId) -> Result<Option<QueuedJob>>;

    /// Get queue statistics.
    async fn stats(&self) -> Result<QueueStats>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory backend
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, QueuedJob>,
    waiting: VecDeque<JobId>,
    processing: HashMap<String, Vec<JobId>>,
    delayed: Vec<(DateTime<Utc>, JobId)>,
    dead: VecDeque<JobId>,
    completed: u64,
    failed: u64,
}

impl MemoryState {
    fn release(&mut self, worker: &str, id: JobId) {
        if let Some(claimed) = self.processing.get_mut(worker) {
            claimed.retain(|j| *j != id);
        }
    }
}

/// In-memory queue backend for testing and development.
///
/// `set_unavailable(true)` makes every write fail with a retryable error,
/// which lets callers exercise their outage handling.
pub struct InMemoryQueueBackend {
    state: Arc<RwLock<MemoryState>>,
    dead_letter_max_size: usize,
    unavailable: AtomicBool,
}

impl InMemoryQueueBackend {
    pub fn new() -> Self {
        Self::with_dead_letter_max_size(10_000)
    }

    pub fn with_dead_letter_max_size(dead_letter_max_size: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            dead_letter_max_size,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate an outage of the backing store.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RollupError::new(ErrorCode::QueueError, "Queue backend unavailable"));
        }
        Ok(())
    }
}

impl Default for InMemoryQueueBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn enqueue(&self, job: QueuedJob) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let id = job.id();
        state.jobs.insert(id, job);
        state.waiting.push_back(id);
        Ok(())
    }

    async fn claim(&self, worker: &str) -> Result<Option<QueuedJob>> {
        self.check_available()?;
        let mut state = self.state.write().await;
        while let Some(id) = state.waiting.pop_front() {
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            job.metadata.mark_running();
            let claimed = job.clone();
            state.processing.entry(worker.to_string()).or_default().push(id);
            return Ok(Some(claimed));
        }
        Ok(None)
    }

    async fn complete(&self, worker: &str, job: &QueuedJob) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        state.release(worker, job.id());
        state.jobs.remove(&job.id());
        state.completed += 1;
        Ok(())
    }

    async fn schedule_retry(&self, worker: &str, job: &QueuedJob, ready_at: DateTime<Utc>) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        state.release(worker, job.id());
        state.jobs.insert(job.id(), job.clone());
        state.delayed.push((ready_at, job.id()));
        Ok(())
    }

    async fn dead_letter(&self, worker: &str, job: &QueuedJob) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        state.release(worker, job.id());
        state.jobs.insert(job.id(), job.clone());
        state.dead.push_front(job.id());
        state.failed += 1;
        while state.dead.len() > self.dead_letter_max_size {
            if let Some(evicted) = state.dead.pop_back() {
                state.jobs.remove(&evicted);
            }
        }
        Ok(())
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let (mut due, pending): (Vec<_>, Vec<_>) =
            state.delayed.drain(..).partition(|(at, _)| *at <= now);
        state.delayed = pending;
        due.sort_by_key(|(at, _)| *at);
        let promoted = due.len();
        state.waiting.extend(due.into_iter().map(|(_, id)| id));
        Ok(promoted)
    }

    async fn recover_stalled(&self, worker: &str) -> Result<usize> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let stalled = state.processing.remove(worker).unwrap_or_default();
        let recovered = stalled.len();
        for id in stalled.into_iter().rev() {
            state.waiting.push_front(id);
        }
        Ok(recovered)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueuedJob>> {
        let state = self.state.read().await;
        Ok(state
            .dead
            .iter()
            .take(limit)
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect())
    }

    async fn replay_dead(&self, id: JobId) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let Some(pos) = state.dead.iter().position(|j| *j == id) else {
            return Ok(false);
        };
        state.dead.remove(pos);
        if let Some(job) = state.jobs.get_mut(&id) {
            job.metadata.reset_for_replay();
            state.waiting.push_back(id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn get(&self, id: JobId) -> Result<Option<QueuedJob>> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state.read().await;
        Ok(QueueStats {
            waiting: state.waiting.len(),
            delayed: state.delayed.len(),
            processing: state.processing.values().map(Vec::len).sum(),
            dead: state.dead.len(),
            completed: state.completed,
            failed: state.failed,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job queue
// ═══════════════════════════════════════════════════════════════════════════════

/// The job queue: a backend plus the retry policy applied on failure.
pub struct JobQueue {
    name: String,
    backend: Arc<dyn QueueBackend>,
    policy: RetryPolicy,
}

impl JobQueue {
    /// Create a new job queue with the given backend.
    pub fn new(name: impl Into<String>, backend: Arc<dyn QueueBackend>, policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            backend,
            policy,
        }
    }

    /// Create a new in-memory job queue (for testing).
    pub fn in_memory(policy: RetryPolicy) -> Self {
        Self::new("in-memory", Arc::new(InMemoryQueueBackend::new()), policy)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// Enqueue a job and return its id.
    pub async fn enqueue(&self, name: &str, payload: serde_json::Value) -> Result<JobId> {
        let metadata = JobMetadata::new(name).with_max_attempts(self.policy.max_attempts);
        let job = QueuedJob::new(metadata, payload);
        let id = job.id();

        self.backend.enqueue(job).await?;

        counter!("rollup_jobs_enqueued_total", "queue" => self.name.clone(), "job" => name.to_string())
            .increment(1);
        tracing::debug!(queue = %self.name, job_id = %id, job_name = name, "Job enqueued");
        Ok(id)
    }

    /// Claim the next job for `worker`.
    pub async fn claim(&self, worker: &str) -> Result<Option<QueuedJob>> {
        self.backend.claim(worker).await
    }

    /// Acknowledge a successfully handled job.
    pub async fn complete(&self, worker: &str, job: &QueuedJob) -> Result<()> {
        self.backend.complete(worker, job).await?;
        counter!("rollup_jobs_completed_total", "queue" => self.name.clone(), "job" => job.name().to_string())
            .increment(1);
        Ok(())
    }

    /// Apply the retry policy to a failed job.
    ///
    /// Returns the job's new status: `Delayed` when it will be redelivered,
    /// `Dead` when it was dead-lettered.
    pub async fn fail(&self, worker: &str, job: &QueuedJob, error: &JobError) -> Result<JobStatus> {
        let mut job = job.clone();
        let attempts = job.metadata.attempts;

        match self.policy.decide(attempts, error) {
            RetryDecision::RetryAfter(delay) => {
                let ready_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                job.metadata.mark_delayed(&error.to_string(), ready_at);
                self.backend.schedule_retry(worker, &job, ready_at).await?;

                counter!("rollup_jobs_retried_total", "queue" => self.name.clone(), "job" => job.name().to_string())
                    .increment(1);
                tracing::warn!(
                    queue = %self.name,
                    job_id = %job.id(),
                    job_name = job.name(),
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job failed, retry scheduled"
                );
                Ok(JobStatus::Delayed)
            }
            RetryDecision::DeadLetter => {
                job.metadata.mark_dead(&error.to_string());
                self.backend.dead_letter(worker, &job).await?;

                counter!("rollup_jobs_dead_total", "queue" => self.name.clone(), "job" => job.name().to_string())
                    .increment(1);
                tracing::error!(
                    queue = %self.name,
                    job_id = %job.id(),
                    job_name = job.name(),
                    attempt = attempts,
                    retryable = error.retryable,
                    error = %error,
                    "Job dead-lettered"
                );
                Ok(JobStatus::Dead)
            }
        }
    }

    /// Move due delayed jobs back to waiting.
    pub async fn promote_due(&self) -> Result<usize> {
        let promoted = self.backend.promote_due(Utc::now()).await?;
        if promoted > 0 {
            tracing::debug!(queue = %self.name, promoted, "Delayed jobs promoted");
        }
        Ok(promoted)
    }

    /// Requeue jobs a previous run of `worker` left claimed.
    pub async fn recover_stalled(&self, worker: &str) -> Result<usize> {
        let recovered = self.backend.recover_stalled(worker).await?;
        if recovered > 0 {
            tracing::warn!(queue = %self.name, worker, recovered, "Recovered stalled jobs");
        }
        Ok(recovered)
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<QueuedJob>> {
        self.backend.dead_letters(limit).await
    }

    /// Send a dead job through the queue again with a fresh attempt budget.
    pub async fn replay_dead(&self, id: JobId) -> Result<()> {
        if self.backend.replay_dead(id).await? {
            tracing::info!(queue = %self.name, job_id = %id, "Dead job replayed");
            Ok(())
        } else {
            Err(RollupError::job_not_found(id))
        }
    }

    pub async fn get(&self, id: JobId) -> Result<Option<QueuedJob>> {
        self.backend.get(id).await
    }

    /// Get queue statistics.
    pub async fn stats(&self) -> Result<QueueStats> {
        self.backend.stats().await
    }
}
