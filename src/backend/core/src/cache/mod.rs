//! Aggregate cache.
//!
//! One entry per entity holding the current [`AggregateRecord`] and a version
//! that increases with every write. Writers use [`AggregateCache::compare_and_set`]
//! so concurrent read-modify-write cycles on the same entity cannot lose updates.
//!
//! A lookup is explicitly [`CacheLookup::Hit`] or [`CacheLookup::Miss`]; a stored
//! mean of `0` is a hit like any other value.

pub mod key;
pub mod memory;
pub mod redis_cache;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::aggregate::{AggregateRecord, EntityId};
use crate::error::Result;

pub use self::key::KeySpace;
pub use self::memory::InMemoryAggregateCache;
pub use self::redis_cache::{connect_redis, RedisAggregateCache};

/// A cached aggregate and the version it was read at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CachedAggregate {
    pub record: AggregateRecord,
    pub version: u64,
}

/// Result of a cache read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CacheLookup {
    Hit(CachedAggregate),
    /// No usable entry; the aggregate must be recomputed
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    /// The version a compare-and-set should expect after this read.
    pub fn expected_version(&self) -> Option<u64> {
        match self {
            Self::Hit(cached) => Some(cached.version),
            Self::Miss => None,
        }
    }
}

/// Result of a compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// Written; the entry now has this version
    Applied { version: u64 },
    /// Someone else wrote the entry since it was read
    Conflict,
}

/// Store for per-entity aggregates.
#[async_trait]
pub trait AggregateCache: Send + Sync {
    /// Read the aggregate for `entity`.
    async fn get(&self, entity: EntityId) -> Result<CacheLookup>;

    /// Overwrite the aggregate unconditionally. Returns the new version.
    async fn set(&self, entity: EntityId, record: AggregateRecord) -> Result<u64>;

    /// Write `record` only if the entry is still at `expected`.
    ///
    /// `None` expects no usable entry, i.e. the read was a [`CacheLookup::Miss`].
    async fn compare_and_set(
        &self,
        entity: EntityId,
        expected: Option<u64>,
        record: AggregateRecord,
    ) -> Result<CasOutcome>;
}
