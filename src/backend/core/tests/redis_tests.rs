//! Integration tests against a live Redis.
//!
//! Skipped unless `ROLLUP_TEST_REDIS_URL` is set, e.g.
//! `ROLLUP_TEST_REDIS_URL=redis://localhost:6379/15 cargo test --test redis_tests`.
//! Every test works under its own random key prefix.
//!
//! Tests cover:
//! - Compare-and-set hits, misses and conflicts
//! - Corrupt entries reading as misses and being recomputed
//! - Concurrent updates through the Lua compare-and-set
//! - Queue retry, dead-letter, replay and stalled-job recovery
//! - Stream consumer redelivery of unacknowledged entries

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use rollup_core::aggregate::{AggregateRecord, AggregateUpdater, DomainEvent, EntityId, EventNames};
use rollup_core::bridge::{BrokerConsumer, BrokerProducer, RedisStreamConsumer, RedisStreamProducer};
use rollup_core::cache::{connect_redis, AggregateCache, CacheLookup, CasOutcome, KeySpace, RedisAggregateCache};
use rollup_core::config::BrokerConfig;
use rollup_core::jobs::{
    BackoffStrategy, JobError, JobQueue, JobStatus, RedisQueueBackend, RetryPolicy,
};
use rollup_core::store::InMemoryAuthoritativeSource;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

async fn redis() -> Option<ConnectionManager> {
    let url = std::env::var("ROLLUP_TEST_REDIS_URL").ok()?;
    Some(connect_redis(&url).await.expect("test Redis unreachable"))
}

fn unique(name: &str) -> String {
    format!("rollup-test:{}:{}", name, Uuid::new_v4().simple())
}

fn cache_on(conn: &ConnectionManager) -> (RedisAggregateCache, KeySpace) {
    let keys = KeySpace::new(unique("cache"));
    (RedisAggregateCache::new(conn.clone(), keys.clone()), keys)
}

fn queue_on(conn: &ConnectionManager, max_attempts: u32) -> JobQueue {
    let backend = RedisQueueBackend::new(conn.clone(), unique("queue"), 100);
    JobQueue::new(
        "review-processing",
        Arc::new(backend),
        RetryPolicy {
            max_attempts,
            backoff: BackoffStrategy::fixed(Duration::from_millis(10)),
        },
    )
}

// ============================================================================
// Compare-and-Set Tests
// ============================================================================

#[tokio::test]
async fn test_cas_on_absent_and_present_entries() {
    let Some(conn) = redis().await else { return };
    let (cache, _) = cache_on(&conn);
    let entity = EntityId(7);

    assert_eq!(cache.get(entity).await.unwrap(), CacheLookup::Miss);
    assert_eq!(
        cache.compare_and_set(entity, None, AggregateRecord::new(4.0, 10)).await.unwrap(),
        CasOutcome::Applied { version: 1 }
    );

    // A second writer that also saw the miss loses.
    assert_eq!(
        cache.compare_and_set(entity, None, AggregateRecord::new(3.0, 1)).await.unwrap(),
        CasOutcome::Conflict
    );
    assert_eq!(
        cache.compare_and_set(entity, Some(0), AggregateRecord::new(3.0, 1)).await.unwrap(),
        CasOutcome::Conflict
    );

    let lookup = cache.get(entity).await.unwrap();
    assert_eq!(lookup.expected_version(), Some(1));
    assert_eq!(
        cache.compare_and_set(entity, Some(1), AggregateRecord::new(45.0 / 11.0, 11)).await.unwrap(),
        CasOutcome::Applied { version: 2 }
    );
}

#[tokio::test]
async fn test_zero_mean_entry_is_a_hit() {
    let Some(conn) = redis().await else { return };
    let (cache, _) = cache_on(&conn);
    let entity = EntityId(1);

    cache.set(entity, AggregateRecord::EMPTY).await.unwrap();
    let lookup = cache.get(entity).await.unwrap();
    assert!(lookup.is_hit());
    assert_eq!(
        cache.compare_and_set(entity, None, AggregateRecord::new(5.0, 1)).await.unwrap(),
        CasOutcome::Conflict
    );
}

/// Every stored entry must read the same way in Rust and in the script:
/// whatever `get` reports, a compare-and-set expecting that answer succeeds.
#[tokio::test]
async fn test_reader_and_script_agree_on_stored_entries() {
    let Some(conn) = redis().await else { return };
    let (cache, keys) = cache_on(&conn);
    let mut raw = conn.clone();

    let entries: &[&[(&str, &str)]] = &[
        &[("averageRating", "nan"), ("reviewCount", "3"), ("version", "4")],
        &[("averageRating", "inf"), ("reviewCount", "3")],
        &[("averageRating", "1e400"), ("reviewCount", "3")],
        &[("averageRating", "0x10"), ("reviewCount", "3")],
        &[("averageRating", "4.0"), ("reviewCount", "18446744073709551616")],
        &[("averageRating", "4.0"), ("reviewCount", "-1")],
        &[("averageRating", "4.0"), ("reviewCount", "3"), ("version", "x")],
        &[("averageRating", "4.0")],
        &[("averageRating", "4.0"), ("reviewCount", " 2")],
        &[("averageRating", " +4.5e0 "), ("reviewCount", "2"), ("version", "007")],
        &[("averageRating", "0"), ("reviewCount", "0")],
    ];

    for (i, fields) in entries.iter().enumerate() {
        let entity = EntityId(100 + i as i64);
        raw.hset_multiple::<_, _, _, ()>(keys.entity(entity), *fields).await.unwrap();

        let lookup = cache.get(entity).await.unwrap();
        let outcome = cache
            .compare_and_set(entity, lookup.expected_version(), AggregateRecord::new(3.0, 1))
            .await
            .unwrap();
        let expected_version = lookup.expected_version().map_or(1, |v| v + 1);
        assert_eq!(
            outcome,
            CasOutcome::Applied { version: expected_version },
            "entry {:?} read as {:?}",
            fields,
            lookup
        );
    }
}

#[tokio::test]
async fn test_corrupt_entry_is_recomputed() {
    let Some(conn) = redis().await else { return };
    let (cache, keys) = cache_on(&conn);
    let cache = Arc::new(cache);
    let source = Arc::new(InMemoryAuthoritativeSource::new());
    let updater = AggregateUpdater::new(cache.clone(), source.clone(), EventNames::default());
    let entity = EntityId(7);

    source.observe_all(entity, [4.0; 10]);
    let mut raw = conn.clone();
    raw.hset_multiple::<_, _, _, ()>(
        keys.entity(entity),
        &[("averageRating", "nan"), ("reviewCount", "3"), ("version", "4")],
    )
    .await
    .unwrap();

    updater.apply(&DomainEvent::added(entity, 5.0)).await.unwrap();

    assert_eq!(source.queries(), 1);
    let CacheLookup::Hit(cached) = cache.get(entity).await.unwrap() else {
        panic!("entry still unusable");
    };
    assert_eq!(cached.record.count, 11);
    assert!((cached.record.mean - 45.0 / 11.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_set_repairs_garbage_version() {
    let Some(conn) = redis().await else { return };
    let (cache, keys) = cache_on(&conn);
    let entity = EntityId(9);

    let mut raw = conn.clone();
    raw.hset::<_, _, _, ()>(keys.entity(entity), "version", "x").await.unwrap();

    assert_eq!(cache.set(entity, AggregateRecord::new(4.0, 2)).await.unwrap(), 1);
    assert_eq!(cache.set(entity, AggregateRecord::new(4.5, 4)).await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_adds_are_not_lost() {
    let Some(conn) = redis().await else { return };
    let (cache, _) = cache_on(&conn);
    let cache = Arc::new(cache);
    let updater = Arc::new(
        AggregateUpdater::new(cache.clone(), Arc::new(InMemoryAuthoritativeSource::new()), EventNames::default())
            .with_max_cas_retries(10_000),
    );
    let entity = EntityId(3);
    cache.set(entity, AggregateRecord::new(4.0, 10)).await.unwrap();

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let updater = updater.clone();
            let value = (i % 5 + 1) as f64;
            tokio::spawn(async move { updater.apply(&DomainEvent::added(entity, value)).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let added: f64 = (0..32).map(|i| (i % 5 + 1) as f64).sum();
    let CacheLookup::Hit(cached) = cache.get(entity).await.unwrap() else {
        panic!("entry missing");
    };
    assert_eq!(cached.record.count, 42);
    assert!((cached.record.mean - (40.0 + added) / 42.0).abs() < 1e-9);
    assert_eq!(cached.version, 33);
}

// ============================================================================
// Queue Tests
// ============================================================================

#[tokio::test]
async fn test_retry_dead_letter_and_replay() {
    let Some(conn) = redis().await else { return };
    let queue = queue_on(&conn, 2);
    let id = queue.enqueue("review-added", json!({"productId": 1, "rating": 4})).await.unwrap();
    let error = JobError::retryable("cache down");

    let job = queue.claim("w1").await.unwrap().unwrap();
    assert_eq!(job.metadata.attempts, 1);
    assert_eq!(queue.fail("w1", &job, &error).await.unwrap(), JobStatus::Delayed);
    let stats = queue.stats().await.unwrap();
    assert_eq!((stats.waiting, stats.delayed, stats.processing), (0, 1, 0));

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(queue.promote_due().await.unwrap(), 1);

    let job = queue.claim("w1").await.unwrap().unwrap();
    assert_eq!(job.metadata.attempts, 2);
    assert_eq!(queue.fail("w1", &job, &error).await.unwrap(), JobStatus::Dead);

    let stats = queue.stats().await.unwrap();
    assert_eq!((stats.waiting, stats.delayed, stats.processing, stats.dead), (0, 0, 0, 1));
    assert_eq!(stats.failed, 1);
    let dead = queue.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].metadata.status, JobStatus::Dead);

    queue.replay_dead(id).await.unwrap();
    let replayed = queue.get(id).await.unwrap().unwrap();
    assert_eq!(replayed.metadata.status, JobStatus::Pending);
    assert_eq!(replayed.metadata.attempts, 0);
    assert!(queue.replay_dead(id).await.is_err());

    let job = queue.claim("w1").await.unwrap().unwrap();
    queue.complete("w1", &job).await.unwrap();
    assert!(queue.get(id).await.unwrap().is_none());
    let stats = queue.stats().await.unwrap();
    assert_eq!((stats.waiting, stats.dead, stats.completed), (0, 0, 1));
}

#[tokio::test]
async fn test_fatal_error_is_dead_lettered_at_once() {
    let Some(conn) = redis().await else { return };
    let queue = queue_on(&conn, 5);
    queue.enqueue("review-added", json!({"rating": 4})).await.unwrap();

    let job = queue.claim("w1").await.unwrap().unwrap();
    let status = queue.fail("w1", &job, &JobError::fatal("missing productId")).await.unwrap();

    assert_eq!(status, JobStatus::Dead);
    assert_eq!(queue.stats().await.unwrap().dead, 1);
}

#[tokio::test]
async fn test_recover_stalled_requeues_only_own_jobs() {
    let Some(conn) = redis().await else { return };
    let queue = queue_on(&conn, 3);
    for i in 0..2 {
        queue.enqueue("review-added", json!({"productId": i, "rating": 4})).await.unwrap();
    }

    let mine = queue.claim("w1").await.unwrap().unwrap();
    queue.claim("w2").await.unwrap().unwrap();
    assert_eq!(queue.stats().await.unwrap().processing, 2);

    assert_eq!(queue.recover_stalled("w1").await.unwrap(), 1);
    let stats = queue.stats().await.unwrap();
    assert_eq!((stats.waiting, stats.processing), (1, 1));

    let reclaimed = queue.claim("w1").await.unwrap().unwrap();
    assert_eq!(reclaimed.id(), mine.id());
    assert_eq!(reclaimed.metadata.attempts, 2);
}

// ============================================================================
// Stream Tests
// ============================================================================

#[tokio::test]
async fn test_unacknowledged_entries_are_redelivered() {
    let Some(conn) = redis().await else { return };
    let stream_conn = connect_redis(&std::env::var("ROLLUP_TEST_REDIS_URL").unwrap())
        .await
        .unwrap();
    let config = BrokerConfig {
        topic: unique("stream"),
        group: "review-consumer".to_string(),
        consumer: "replica-a".to_string(),
        block_ms: 50,
        ..BrokerConfig::default()
    };
    let producer = RedisStreamProducer::new(conn.clone(), config.topic.clone());

    let mut consumer = RedisStreamConsumer::connect(stream_conn.clone(), &config).await.unwrap();
    producer.publish("review-added", br#"{"productId":1,"rating":5}"#).await.unwrap();
    producer.publish("review-deleted", br#"{"productId":1,"rating":5}"#).await.unwrap();

    let first = consumer.poll().await.unwrap().unwrap();
    assert_eq!(first.key.as_deref(), Some("review-added"));
    consumer.commit(&first).await.unwrap();
    let second = consumer.poll().await.unwrap().unwrap();
    assert_eq!(second.key.as_deref(), Some("review-deleted"));
    drop(consumer);

    // Same consumer name after a restart: the unacknowledged entry comes back first.
    let mut restarted = RedisStreamConsumer::connect(stream_conn, &config).await.unwrap();
    let again = restarted.poll().await.unwrap().unwrap();
    assert_eq!(again.id, second.id);
    restarted.commit(&again).await.unwrap();
    assert!(restarted.poll().await.unwrap().is_none());

    let id = producer.publish("review-added", br#"{"productId":2,"rating":3}"#).await.unwrap();
    let third = restarted.poll().await.unwrap().unwrap();
    assert_eq!(third.id, id);

    restarted.rewind().await.unwrap();
    let rewound = restarted.poll().await.unwrap().unwrap();
    assert_eq!(rewound.id, id);
    restarted.commit(&rewound).await.unwrap();
}
