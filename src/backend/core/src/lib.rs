#![allow(clippy::result_large_err)]
//! # Rollup Core
//!
//! Keeps per-entity running aggregates (mean and count) current as review
//! events arrive.
//!
//! ## Architecture
//!
//! - **Bridge**: Reads keyed events from the broker and enqueues them as jobs
//! - **Jobs**: Durable queue with retries, backoff and a dead-letter list
//! - **Aggregate**: Incremental mean/count arithmetic and the job handler applying it
//! - **Cache**: Versioned aggregate entries with compare-and-set writes
//! - **Store**: Authoritative recomputation when the cache is cold
//! - **Telemetry**: Structured logging, optional OTLP tracing and Prometheus metrics

pub mod aggregate;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod error;
pub mod jobs;
pub mod pipeline;
pub mod store;
pub mod telemetry;

pub use error::{ErrorCode, ErrorDetails, ErrorSeverity, Result, RollupError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::aggregate::{
        AggregateRecord, AggregateUpdater, ApplyOutcome, Change, DomainEvent, EntityId, EventKind,
        EventNames, UpdateOutcome,
    };
    pub use crate::bridge::{
        BrokerConsumer, BrokerMessage, BrokerProducer, IngestionBridge, MessageOutcome,
    };
    pub use crate::cache::{AggregateCache, CacheLookup, CachedAggregate, CasOutcome, KeySpace};
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, ErrorDetails, ErrorSeverity, Result, RollupError};
    pub use crate::jobs::{
        JobError, JobHandler, JobId, JobQueue, JobStatus, JobWorker, QueuedJob, RetryPolicy,
        WorkerConfig,
    };
    pub use crate::pipeline::{Pipeline, RunningPipeline};
    pub use crate::store::AuthoritativeSource;
}
