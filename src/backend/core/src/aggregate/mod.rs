//! Incrementally maintained aggregates.
//!
//! [`AggregateRecord::apply`] holds the arithmetic; [`AggregateUpdater`] runs
//! it against the cache with a fallback to the authoritative source.

pub mod event;
pub mod record;
pub mod updater;

pub use event::{Change, DomainEvent, EntityId, EventKind, EventNames};
pub use record::{AggregateRecord, ApplyOutcome};
pub use updater::{AggregateUpdater, UpdateOutcome};
