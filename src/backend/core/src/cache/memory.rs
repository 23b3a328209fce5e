//! In-memory aggregate cache for tests and development.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::counter;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{AggregateCache, CacheLookup, CachedAggregate, CasOutcome};
use crate::aggregate::{AggregateRecord, EntityId};
use crate::error::{ErrorCode, Result, RollupError};

/// DashMap-backed cache with the same compare-and-set semantics as Redis.
#[derive(Default)]
pub struct InMemoryAggregateCache {
    entries: DashMap<EntityId, CachedAggregate>,
    unavailable: AtomicBool,
}

impl InMemoryAggregateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entry at a specific version.
    pub fn insert(&self, entity: EntityId, record: AggregateRecord, version: u64) {
        self.entries.insert(entity, CachedAggregate { record, version });
    }

    /// Current entry without going through the async interface.
    pub fn peek(&self, entity: EntityId) -> Option<CachedAggregate> {
        self.entries.get(&entity).map(|e| *e.value())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Simulate a cache outage: every call fails with a retryable error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RollupError::new(ErrorCode::CacheConnectionFailed, "Cache unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl AggregateCache for InMemoryAggregateCache {
    async fn get(&self, entity: EntityId) -> Result<CacheLookup> {
        self.check_available()?;
        match self.entries.get(&entity) {
            Some(entry) => {
                counter!("rollup_cache_lookups_total", "backend" => "memory", "result" => "hit").increment(1);
                Ok(CacheLookup::Hit(*entry.value()))
            }
            None => {
                counter!("rollup_cache_lookups_total", "backend" => "memory", "result" => "miss").increment(1);
                Ok(CacheLookup::Miss)
            }
        }
    }

    async fn set(&self, entity: EntityId, record: AggregateRecord) -> Result<u64> {
        self.check_available()?;
        let mut entry = self.entries.entry(entity).or_insert(CachedAggregate {
            record,
            version: 0,
        });
        entry.record = record;
        entry.version += 1;
        Ok(entry.version)
    }

    async fn compare_and_set(
        &self,
        entity: EntityId,
        expected: Option<u64>,
        record: AggregateRecord,
    ) -> Result<CasOutcome> {
        self.check_available()?;
        let outcome = match (self.entries.entry(entity), expected) {
            (Entry::Occupied(mut e), Some(version)) if e.get().version == version => {
                let version = version + 1;
                e.insert(CachedAggregate { record, version });
                CasOutcome::Applied { version }
            }
            (Entry::Vacant(e), None) => {
                e.insert(CachedAggregate { record, version: 1 });
                CasOutcome::Applied { version: 1 }
            }
            _ => CasOutcome::Conflict,
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_miss_then_cas_insert() {
        let cache = InMemoryAggregateCache::new();
        assert_eq!(cache.get(EntityId(1)).await.unwrap(), CacheLookup::Miss);

        let record = AggregateRecord::new(4.0, 2);
        let outcome = cache.compare_and_set(EntityId(1), None, record).await.unwrap();
        assert_eq!(outcome, CasOutcome::Applied { version: 1 });

        let lookup = cache.get(EntityId(1)).await.unwrap();
        assert_eq!(lookup, CacheLookup::Hit(CachedAggregate { record, version: 1 }));
    }

    #[tokio::test]
    async fn test_zero_mean_is_a_hit() {
        let cache = InMemoryAggregateCache::new();
        cache.insert(EntityId(5), AggregateRecord { mean: 0.0, count: 3 }, 7);
        assert!(cache.get(EntityId(5)).await.unwrap().is_hit());
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let cache = InMemoryAggregateCache::new();
        cache.insert(EntityId(1), AggregateRecord::new(3.0, 1), 4);

        let stale = cache
            .compare_and_set(EntityId(1), Some(3), AggregateRecord::new(1.0, 1))
            .await
            .unwrap();
        assert_eq!(stale, CasOutcome::Conflict);

        let absent = cache
            .compare_and_set(EntityId(1), None, AggregateRecord::new(1.0, 1))
            .await
            .unwrap();
        assert_eq!(absent, CasOutcome::Conflict);

        assert_eq!(cache.peek(EntityId(1)).unwrap().record, AggregateRecord::new(3.0, 1));
    }

    #[tokio::test]
    async fn test_set_bumps_version() {
        let cache = InMemoryAggregateCache::new();
        assert_eq!(cache.set(EntityId(2), AggregateRecord::new(2.0, 1)).await.unwrap(), 1);
        assert_eq!(cache.set(EntityId(2), AggregateRecord::new(3.0, 2)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_cache_errors() {
        let cache = InMemoryAggregateCache::new();
        cache.set_unavailable(true);
        let err = cache.get(EntityId(1)).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
