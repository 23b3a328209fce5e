//! In-memory authoritative source for tests and development.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::AuthoritativeSource;
use crate::aggregate::{AggregateRecord, EntityId};
use crate::error::{ErrorCode, Result, RollupError};

/// Holds raw observations per entity and aggregates them on demand.
#[derive(Default)]
pub struct InMemoryAuthoritativeSource {
    observations: RwLock<HashMap<EntityId, Vec<f64>>>,
    queries: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryAuthoritativeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observations(entity: EntityId, values: impl IntoIterator<Item = f64>) -> Self {
        let source = Self::new();
        source.observe_all(entity, values);
        source
    }

    pub fn observe(&self, entity: EntityId, value: f64) {
        self.observations.write().entry(entity).or_default().push(value);
    }

    pub fn observe_all(&self, entity: EntityId, values: impl IntoIterator<Item = f64>) {
        self.observations.write().entry(entity).or_default().extend(values);
    }

    /// Number of recompute calls served so far.
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Simulate a database outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuthoritativeSource for InMemoryAuthoritativeSource {
    async fn recompute(&self, entity: EntityId) -> Result<AggregateRecord> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RollupError::new(ErrorCode::DatabaseConnectionFailed, "Database unavailable"));
        }
        self.queries.fetch_add(1, Ordering::Relaxed);

        let observations = self.observations.read();
        let Some(values) = observations.get(&entity).filter(|v| !v.is_empty()) else {
            return Ok(AggregateRecord::EMPTY);
        };
        let sum: f64 = values.iter().sum();
        Ok(AggregateRecord::new(sum / values.len() as f64, values.len() as u64))
    }
}
