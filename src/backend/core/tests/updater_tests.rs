//! Tests for the aggregate updater against in-memory stores.
//!
//! Tests cover:
//! - Cold-cache recomputation
//! - Zero means stored in the cache
//! - Precondition violations
//! - Redelivered jobs
//! - Concurrent updates to one entity
//! - Error propagation to the job boundary

use rollup_core::aggregate::{AggregateRecord, AggregateUpdater, DomainEvent, EntityId, EventNames, UpdateOutcome};
use rollup_core::cache::{AggregateCache, InMemoryAggregateCache};
use rollup_core::jobs::{JobHandler, JobMetadata, QueuedJob};
use rollup_core::store::InMemoryAuthoritativeSource;
use serde_json::json;
use std::sync::Arc;

const PRODUCT: EntityId = EntityId(42);

struct Fixture {
    updater: Arc<AggregateUpdater>,
    cache: Arc<InMemoryAggregateCache>,
    source: Arc<InMemoryAuthoritativeSource>,
}

fn fixture() -> Fixture {
    let cache = Arc::new(InMemoryAggregateCache::new());
    let source = Arc::new(InMemoryAuthoritativeSource::new());
    let updater = Arc::new(AggregateUpdater::new(cache.clone(), source.clone(), EventNames::default()));
    Fixture {
        updater,
        cache,
        source,
    }
}

fn assert_record(actual: AggregateRecord, mean: f64, count: u64) {
    assert_eq!(actual.count, count, "count of {}", actual);
    assert!((actual.mean - mean).abs() < 1e-9, "mean of {}", actual);
}

// ============================================================================
// Cold Cache Tests
// ============================================================================

#[tokio::test]
async fn test_cold_cache_applies_event_to_recomputed_aggregate() {
    let f = fixture();
    f.source.observe_all(PRODUCT, [4.0; 10]);

    let outcome = f.updater.apply(&DomainEvent::added(PRODUCT, 5.0)).await.unwrap();

    assert!(matches!(outcome, UpdateOutcome::Applied { .. }));
    assert_eq!(f.source.queries(), 1);
    let cached = f.cache.peek(PRODUCT).unwrap();
    assert_record(cached.record, 45.0 / 11.0, 11);
}

#[tokio::test]
async fn test_cold_cache_with_no_observations_starts_empty() {
    let f = fixture();

    f.updater.apply(&DomainEvent::added(PRODUCT, 3.0)).await.unwrap();

    assert_record(f.cache.peek(PRODUCT).unwrap().record, 3.0, 1);
}

#[tokio::test]
async fn test_zero_mean_is_a_hit() {
    let f = fixture();
    f.source.observe_all(PRODUCT, [5.0; 4]);
    f.cache.insert(PRODUCT, AggregateRecord::new(0.0, 3), 7);

    f.updater.apply(&DomainEvent::added(PRODUCT, 4.0)).await.unwrap();

    assert_eq!(f.source.queries(), 0);
    let cached = f.cache.peek(PRODUCT).unwrap();
    assert_record(cached.record, 1.0, 4);
    assert_eq!(cached.version, 8);
}

#[tokio::test]
async fn test_empty_entry_is_a_hit() {
    let f = fixture();
    f.source.observe_all(PRODUCT, [5.0; 4]);
    f.cache.insert(PRODUCT, AggregateRecord::EMPTY, 2);

    f.updater.apply(&DomainEvent::added(PRODUCT, 2.0)).await.unwrap();

    assert_eq!(f.source.queries(), 0);
    assert_record(f.cache.peek(PRODUCT).unwrap().record, 2.0, 1);
}

// ============================================================================
// Precondition Tests
// ============================================================================

#[tokio::test]
async fn test_update_on_empty_aggregate_leaves_cache_unchanged() {
    let f = fixture();
    f.cache.insert(PRODUCT, AggregateRecord::EMPTY, 5);

    let outcome = f
        .updater
        .process("review-updated", &json!({"productId": 42, "rating": 5, "oldRating": 4}))
        .await
        .unwrap();

    assert_eq!(outcome, UpdateOutcome::PreconditionViolated { entity: PRODUCT });
    let cached = f.cache.peek(PRODUCT).unwrap();
    assert_eq!(cached.record, AggregateRecord::EMPTY);
    assert_eq!(cached.version, 5);
}

#[tokio::test]
async fn test_violation_completes_the_job() {
    let f = fixture();
    f.cache.insert(PRODUCT, AggregateRecord::EMPTY, 1);
    let job = QueuedJob::new(
        JobMetadata::new("review-updated"),
        json!({"productId": 42, "rating": 5, "oldRating": 4}),
    );

    assert!(f.updater.handle(&job).await.is_ok());
}

// ============================================================================
// Delivery Semantics
// ============================================================================

#[tokio::test]
async fn test_redelivered_add_is_counted_twice() {
    let f = fixture();
    f.cache.insert(PRODUCT, AggregateRecord::new(4.0, 10), 1);
    let job = QueuedJob::new(JobMetadata::new("review-added"), json!({"productId": 42, "rating": 5}));

    f.updater.handle(&job).await.unwrap();
    f.updater.handle(&job).await.unwrap();

    assert_record(f.cache.peek(PRODUCT).unwrap().record, 50.0 / 12.0, 12);
}

#[tokio::test]
async fn test_cold_cache_recompute_includes_new_observation() {
    // The database row for the new review already exists when its event is
    // processed, so a cold-cache add counts that review twice.
    let f = fixture();
    f.source.observe_all(PRODUCT, [4.0, 4.0, 5.0]);

    f.updater.apply(&DomainEvent::added(PRODUCT, 5.0)).await.unwrap();

    assert_record(f.cache.peek(PRODUCT).unwrap().record, 18.0 / 4.0, 4);
}

#[test]
fn test_concurrent_adds_are_not_lost() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let cache = Arc::new(InMemoryAggregateCache::new());
        let source = Arc::new(InMemoryAuthoritativeSource::new());
        let updater = Arc::new(
            AggregateUpdater::new(cache.clone(), source.clone(), EventNames::default())
                .with_max_cas_retries(10_000),
        );
        cache.insert(PRODUCT, AggregateRecord::new(4.0, 10), 1);

        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let updater = updater.clone();
                let value = (i % 5 + 1) as f64;
                tokio::spawn(async move { updater.apply(&DomainEvent::added(PRODUCT, value)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let added: f64 = (0..64).map(|i| (i % 5 + 1) as f64).sum();
        let cached = cache.peek(PRODUCT).unwrap();
        assert_record(cached.record, (40.0 + added) / 74.0, 74);
        assert_eq!(cached.version, 65);
    });
}

// ============================================================================
// Error Propagation
// ============================================================================

#[tokio::test]
async fn test_cache_outage_is_retryable() {
    let f = fixture();
    f.cache.set_unavailable(true);
    let job = QueuedJob::new(JobMetadata::new("review-added"), json!({"productId": 42, "rating": 5}));

    let err = f.updater.handle(&job).await.unwrap_err();
    assert!(err.retryable);
}

#[tokio::test]
async fn test_database_outage_on_cold_cache_is_retryable() {
    let f = fixture();
    f.source.set_unavailable(true);
    let job = QueuedJob::new(JobMetadata::new("review-deleted"), json!({"productId": 42, "rating": 5}));

    let err = f.updater.handle(&job).await.unwrap_err();
    assert!(err.retryable);
    assert!(f.cache.is_empty());
}

#[tokio::test]
async fn test_malformed_payload_is_fatal() {
    let f = fixture();
    let job = QueuedJob::new(JobMetadata::new("review-added"), json!({"rating": 5}));

    let err = f.updater.handle(&job).await.unwrap_err();
    assert!(!err.retryable);
}

#[tokio::test]
async fn test_unconditional_set_bumps_version() {
    let f = fixture();
    let first = f.cache.set(PRODUCT, AggregateRecord::new(3.0, 2)).await.unwrap();
    let second = f.cache.set(PRODUCT, AggregateRecord::new(4.0, 3)).await.unwrap();
    assert_eq!(second, first + 1);
}
