//! Applies events to cached aggregates.
//!
//! Each job is one optimistic read-modify-write: read the entry and its
//! version, recompute from the database if the cache is cold, apply the
//! change, then compare-and-set. A conflicting write by another worker
//! restarts the cycle from the read.

use async_trait::async_trait;
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, warn};

use super::event::{DomainEvent, EventNames};
use super::record::{AggregateRecord, ApplyOutcome};
use super::EntityId;
use crate::cache::{AggregateCache, CacheLookup, CasOutcome};
use crate::error::{Result, RollupError};
use crate::jobs::{JobError, JobHandler, JobResult, QueuedJob};
use crate::store::AuthoritativeSource;

/// What one job did to its aggregate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateOutcome {
    /// The new aggregate was written at `version`
    Applied {
        entity: EntityId,
        record: AggregateRecord,
        version: u64,
    },
    /// The change could not apply; nothing was written
    PreconditionViolated { entity: EntityId },
    /// The job name matches no configured event
    Ignored,
}

/// Job handler keeping aggregates current.
pub struct AggregateUpdater {
    cache: Arc<dyn AggregateCache>,
    source: Arc<dyn AuthoritativeSource>,
    names: EventNames,
    max_cas_retries: u32,
}

impl AggregateUpdater {
    pub fn new(
        cache: Arc<dyn AggregateCache>,
        source: Arc<dyn AuthoritativeSource>,
        names: EventNames,
    ) -> Self {
        Self {
            cache,
            source,
            names,
            max_cas_retries: 8,
        }
    }

    /// Compare-and-set attempts per job before failing with a retryable conflict.
    pub fn with_max_cas_retries(mut self, retries: u32) -> Self {
        self.max_cas_retries = retries.max(1);
        self
    }

    pub fn names(&self) -> &EventNames {
        &self.names
    }

    /// Process one job by name and payload.
    pub async fn process(&self, name: &str, payload: &serde_json::Value) -> Result<UpdateOutcome> {
        let Some(kind) = self.names.kind_of(name) else {
            debug!(job_name = name, "Ignoring job with unknown name");
            counter!("rollup_updater_ignored_total").increment(1);
            return Ok(UpdateOutcome::Ignored);
        };

        let event = DomainEvent::from_payload(kind, payload)?;
        self.apply(&event).await
    }

    /// Apply a decoded event to its aggregate.
    pub async fn apply(&self, event: &DomainEvent) -> Result<UpdateOutcome> {
        let change = event.change()?;
        let entity = event.entity_id;

        for attempt in 1..=self.max_cas_retries {
            let lookup = self.cache.get(entity).await?;
            let current = match lookup {
                CacheLookup::Hit(cached) => cached.record,
                CacheLookup::Miss => {
                    counter!("rollup_cache_fallbacks_total").increment(1);
                    let record = self.source.recompute(entity).await?;
                    debug!(entity_id = %entity, %record, "Cold cache, recomputed aggregate");
                    record
                }
            };

            let next = match current.apply(&change) {
                ApplyOutcome::Updated(next) => next,
                ApplyOutcome::PreconditionViolated(reason) => {
                    let error = RollupError::precondition_violated(entity, reason)
                        .with_context("kind", event.kind.to_string())
                        .with_context("count", current.count);
                    warn!(
                        entity_id = %entity,
                        kind = %event.kind,
                        count = current.count,
                        error = %error,
                        "Precondition violated, aggregate left unchanged"
                    );
                    counter!("rollup_precondition_violations_total", "kind" => event.kind.to_string())
                        .increment(1);
                    return Ok(UpdateOutcome::PreconditionViolated { entity });
                }
            };

            match self
                .cache
                .compare_and_set(entity, lookup.expected_version(), next)
                .await?
            {
                CasOutcome::Applied { version } => {
                    counter!("rollup_aggregate_updates_total", "kind" => event.kind.to_string())
                        .increment(1);
                    debug!(entity_id = %entity, kind = %event.kind, %next, version, "Aggregate updated");
                    return Ok(UpdateOutcome::Applied {
                        entity,
                        record: next,
                        version,
                    });
                }
                CasOutcome::Conflict => {
                    counter!("rollup_cas_conflicts_total").increment(1);
                    debug!(entity_id = %entity, attempt, "Concurrent write, retrying");
                    tokio::task::yield_now().await;
                }
            }
        }

        Err(RollupError::cas_conflict(entity, self.max_cas_retries))
    }
}

#[async_trait]
impl JobHandler for AggregateUpdater {
    async fn handle(&self, job: &QueuedJob) -> JobResult {
        self.process(job.name(), &job.payload)
            .await
            .map(|_| ())
            .map_err(JobError::from)
    }
}
