//! Authoritative source: exact recomputation of an aggregate from the
//! observations themselves. Only consulted when the cache has no usable entry.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::aggregate::{AggregateRecord, EntityId};
use crate::error::Result;

pub use self::memory::InMemoryAuthoritativeSource;
pub use self::postgres::{AggregateQuery, PgAuthoritativeSource};

#[async_trait]
pub trait AuthoritativeSource: Send + Sync {
    /// Exact mean and count over every observation of `entity`; `(0, 0)` when there are none.
    async fn recompute(&self, entity: EntityId) -> Result<AggregateRecord>;
}
