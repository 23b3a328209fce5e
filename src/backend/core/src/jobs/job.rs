//! Job definitions and traits.
//!
//! - **JobHandler trait**: what the worker invokes for every claimed job
//! - **JobStatus**: lifecycle of a job inside the queue
//! - **JobError**: handler failure, split into retryable and fatal
//! - **RetryPolicy**: maximum deliveries plus a backoff strategy

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::queue::QueuedJob;
use crate::config::QueueSettings;
use crate::error::{ErrorCode, RollupError};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a job ID from its textual form.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed
    Pending,
    /// Failed with a retryable error, waiting for its backoff to elapse
    Delayed,
    /// Claimed by a worker
    Running,
    /// Abandoned after a fatal error or exhausted retries
    Dead,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    ///
    /// Completed jobs are removed from the queue, so `Dead` is the only
    /// terminal state a stored job can be in.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Dead)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Delayed => write!(f, "delayed"),
            Self::Running => write!(f, "running"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type for job execution failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Whether this error is retryable
    pub retryable: bool,
    /// Optional error code
    pub code: Option<String>,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
        }
    }

    /// Create a new non-retryable (fatal) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
        }
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<RollupError> for JobError {
    fn from(error: RollupError) -> Self {
        error.log();
        Self {
            message: error.to_string(),
            retryable: error.is_retryable(),
            code: Some(error.code().to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for JobError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::retryable("handler timed out").with_code(ErrorCode::HandlerTimeout.to_string())
    }
}

/// Result type for job execution.
pub type JobResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Handler
// ═══════════════════════════════════════════════════════════════════════════════

/// Processes claimed jobs.
///
/// A handler is invoked at least once per job. Returning `Ok(())` acknowledges
/// the job; an error hands it back to the queue's retry policy.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &QueuedJob) -> JobResult;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed { delay_ms: u64 },
    /// Exponential increase in delay (initial * multiplier^retry), capped
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Delay before retry number `retry` (0 = first retry).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let ms = match self {
            Self::Fixed { delay_ms } => *delay_ms,
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let exponent = retry.min(i32::MAX as u32) as i32;
                let delay = (*initial_delay_ms as f64) * multiplier.powi(exponent);
                delay.min(*max_delay_ms as f64) as u64
            }
        };

        Duration::from_millis(ms)
    }

    /// Create a fixed backoff strategy.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// What the queue does with a job after its handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Redeliver once the delay has elapsed
    RetryAfter(Duration),
    /// Move to the dead-letter list
    DeadLetter,
}

/// Configuration for job retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of deliveries, the first one included
    pub max_attempts: u32,
    /// Backoff strategy for calculating delays
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// Build the policy from queue settings.
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            backoff: BackoffStrategy::Exponential {
                initial_delay_ms: settings.backoff_initial_secs.saturating_mul(1_000),
                max_delay_ms: settings.backoff_max_secs.saturating_mul(1_000),
                multiplier: settings.backoff_multiplier,
            },
        }
    }

    /// Create a policy that never redelivers.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Check if another delivery should be attempted after `attempts` deliveries.
    pub fn should_retry(&self, attempts: u32, error: &JobError) -> bool {
        error.retryable && attempts < self.max_attempts
    }

    /// Decide the fate of a job that failed on its `attempts`-th delivery.
    pub fn decide(&self, attempts: u32, error: &JobError) -> RetryDecision {
        if self.should_retry(attempts, error) {
            RetryDecision::RetryAfter(self.backoff.delay_for_retry(attempts.saturating_sub(1)))
        } else {
            RetryDecision::DeadLetter
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Metadata
// ═══════════════════════════════════════════════════════════════════════════════

/// Metadata associated with a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Unique job identifier
    pub id: JobId,
    /// Job name (the broker event key)
    pub name: String,
    /// Current status
    pub status: JobStatus,
    /// Number of deliveries so far
    pub attempts: u32,
    /// Maximum deliveries allowed
    pub max_attempts: u32,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// When the latest delivery started
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
    /// When a delayed job becomes eligible again
    pub retry_at: Option<DateTime<Utc>>,
    /// Last error message (if failed)
    pub last_error: Option<String>,
}

impl JobMetadata {
    /// Create new metadata for a job.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: RetryPolicy::default().max_attempts,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            retry_at: None,
            last_error: None,
        }
    }

    /// Set the maximum attempts.
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// Mark as running; counts one delivery.
    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        self.retry_at = None;
        self.attempts += 1;
    }

    /// Mark as delayed until `at`.
    pub fn mark_delayed(&mut self, error: &str, at: DateTime<Utc>) {
        self.status = JobStatus::Delayed;
        self.retry_at = Some(at);
        self.last_error = Some(error.to_string());
    }

    /// Mark as dead (no more retries).
    pub fn mark_dead(&mut self, error: &str) {
        self.status = JobStatus::Dead;
        self.finished_at = Some(Utc::now());
        self.last_error = Some(error.to_string());
    }

    /// Reset a dead job so it can be delivered again from scratch.
    pub fn reset_for_replay(&mut self) {
        self.status = JobStatus::Pending;
        self.attempts = 0;
        self.started_at = None;
        self.finished_at = None;
        self.retry_at = None;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_roundtrip() {
        let id = JobId::new();
        let parsed = JobId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(JobId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Delayed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Dead.is_terminal());
    }

    #[test]
    fn test_default_backoff_doubles_and_caps() {
        let backoff = BackoffStrategy::default();
        assert_eq!(backoff.delay_for_retry(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_retry(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_retry(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_retry(6), Duration::from_secs(60));
        assert_eq!(backoff.delay_for_retry(40), Duration::from_secs(60));
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = BackoffStrategy::fixed(Duration::from_millis(250));
        assert_eq!(backoff.delay_for_retry(0), Duration::from_millis(250));
        assert_eq!(backoff.delay_for_retry(9), Duration::from_millis(250));
    }

    #[test]
    fn test_retry_policy_decisions() {
        let policy = RetryPolicy::default();
        let transient = JobError::retryable("redis down");
        let fatal = JobError::fatal("bad payload");

        assert_eq!(
            policy.decide(1, &transient),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            policy.decide(3, &transient),
            RetryDecision::RetryAfter(Duration::from_secs(4))
        );
        assert_eq!(policy.decide(5, &transient), RetryDecision::DeadLetter);
        assert_eq!(policy.decide(1, &fatal), RetryDecision::DeadLetter);
    }

    #[test]
    fn test_retry_policy_from_settings() {
        let settings = QueueSettings {
            max_attempts: 2,
            backoff_initial_secs: 3,
            backoff_max_secs: 10,
            backoff_multiplier: 3.0,
            ..Default::default()
        };
        let policy = RetryPolicy::from_settings(&settings);
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.backoff.delay_for_retry(0), Duration::from_secs(3));
        assert_eq!(policy.backoff.delay_for_retry(1), Duration::from_secs(9));
        assert_eq!(policy.backoff.delay_for_retry(2), Duration::from_secs(10));
    }

    #[test]
    fn test_job_error_from_rollup_error() {
        let error = JobError::from(RollupError::invalid_payload("missing value"));
        assert!(!error.retryable);
        assert_eq!(error.code.as_deref(), Some("InvalidPayload"));

        let error = JobError::from(RollupError::cas_conflict(7, 3));
        assert!(error.retryable);
    }

    #[test]
    fn test_metadata_lifecycle() {
        let mut meta = JobMetadata::new("review-added").with_max_attempts(2);
        assert_eq!(meta.status, JobStatus::Pending);
        assert_eq!(meta.attempts, 0);

        meta.mark_running();
        assert_eq!(meta.status, JobStatus::Running);
        assert_eq!(meta.attempts, 1);

        meta.mark_delayed("boom", Utc::now());
        assert_eq!(meta.status, JobStatus::Delayed);
        assert!(meta.retry_at.is_some());

        meta.mark_running();
        meta.mark_dead("boom again");
        assert_eq!(meta.status, JobStatus::Dead);
        assert_eq!(meta.attempts, 2);
        assert_eq!(meta.last_error.as_deref(), Some("boom again"));

        meta.reset_for_replay();
        assert_eq!(meta.status, JobStatus::Pending);
        assert_eq!(meta.attempts, 0);
        assert!(meta.finished_at.is_none());
    }
}
