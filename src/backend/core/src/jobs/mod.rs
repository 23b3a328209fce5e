//! Durable work queue.
//!
//! - **Job**: ids, lifecycle states, handler errors and the retry policy
//! - **Queue**: backends (Redis, in-memory) and the [`JobQueue`] facade that applies the policy
//! - **Worker**: concurrent dispatch to a [`JobHandler`] with timeouts and graceful shutdown
//!
//! # Lifecycle
//!
//! ```text
//!   enqueue ──▶ Pending ──claim──▶ Running ──ok──▶ removed, counted as completed
//!                  ▲                  │
//!                  │ promote_due      │ retryable error, attempts left
//!                  │                  ▼
//!                  └──────────── Delayed
//!                                     │ fatal error or attempts exhausted
//!                                     ▼
//!                                    Dead ──replay_dead──▶ Pending
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use rollup_core::jobs::{JobQueue, JobWorker, RetryPolicy, WorkerConfig};
//!
//! let queue = Arc::new(JobQueue::in_memory(RetryPolicy::default()));
//! queue.enqueue("review-added", serde_json::json!({"productId": 7, "rating": 5})).await?;
//!
//! let handle = JobWorker::new(WorkerConfig::default()).start(queue, handler);
//! // ...
//! handle.stop().await;
//! ```

pub mod job;
pub mod queue;
pub mod redis_queue;
pub mod worker;

pub use job::{
    BackoffStrategy, JobError, JobHandler, JobId, JobMetadata, JobResult, JobStatus,
    RetryDecision, RetryPolicy,
};
pub use queue::{InMemoryQueueBackend, JobQueue, QueueBackend, QueueStats, QueuedJob};
pub use redis_queue::RedisQueueBackend;
pub use worker::{JobWorker, WorkerConfig, WorkerHandle, WorkerStats};
