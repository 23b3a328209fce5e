//! Tests for the incremental aggregate arithmetic.
//!
//! Tests cover:
//! - Worked add/remove/update scenarios
//! - Removing the last observation
//! - Updates on an empty aggregate
//! - Agreement with the exact mean of the surviving observations

use rollup_core::aggregate::{AggregateRecord, ApplyOutcome, Change, DomainEvent, EventKind};
use serde_json::json;

const EPSILON: f64 = 1e-9;

fn applied(record: AggregateRecord, change: Change) -> AggregateRecord {
    match record.apply(&change) {
        ApplyOutcome::Updated(next) => next,
        ApplyOutcome::PreconditionViolated(reason) => panic!("unexpected violation: {}", reason),
    }
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < EPSILON,
        "expected {}, got {}",
        expected,
        actual
    );
}

// ============================================================================
// Worked Scenarios
// ============================================================================

#[test]
fn test_add_to_existing_aggregate() {
    let record = applied(AggregateRecord::new(4.0, 10), Change::Added { value: 5.0 });
    assert_eq!(record.count, 11);
    assert_close(record.mean, 45.0 / 11.0);
}

#[test]
fn test_remove_inverts_add() {
    let start = AggregateRecord::new(4.0, 10);
    let added = applied(start, Change::Added { value: 5.0 });
    let removed = applied(added, Change::Removed { value: 5.0 });

    assert_eq!(removed.count, 10);
    assert_close(removed.mean, 4.0);
}

#[test]
fn test_update_keeps_count() {
    let record = applied(
        AggregateRecord::new(4.0, 10),
        Change::Updated {
            previous: 4.0,
            value: 5.0,
        },
    );
    assert_eq!(record.count, 10);
    assert_close(record.mean, 4.1);
}

#[test]
fn test_remove_last_observation_is_exactly_empty() {
    let record = applied(AggregateRecord::new(5.0, 1), Change::Removed { value: 5.0 });
    assert_eq!(record, AggregateRecord::EMPTY);
    assert_eq!(record.mean, 0.0);
}

#[test]
fn test_remove_last_observation_ignores_value() {
    // Any value leaves nothing behind once the only observation is gone.
    let record = applied(AggregateRecord::new(3.0, 1), Change::Removed { value: 4.5 });
    assert_eq!(record, AggregateRecord::EMPTY);
}

#[test]
fn test_remove_from_empty_stays_empty() {
    let record = applied(AggregateRecord::EMPTY, Change::Removed { value: 2.0 });
    assert_eq!(record, AggregateRecord::EMPTY);
}

#[test]
fn test_first_add_sets_mean_to_value() {
    let record = applied(AggregateRecord::EMPTY, Change::Added { value: 3.5 });
    assert_eq!(record.count, 1);
    assert_close(record.mean, 3.5);
}

// ============================================================================
// Precondition Tests
// ============================================================================

#[test]
fn test_update_on_empty_is_violation() {
    let outcome = AggregateRecord::EMPTY.apply(&Change::Updated {
        previous: 4.0,
        value: 5.0,
    });
    assert!(matches!(outcome, ApplyOutcome::PreconditionViolated(_)));
}

#[test]
fn test_new_with_zero_count_normalises_mean() {
    assert_eq!(AggregateRecord::new(3.7, 0), AggregateRecord::EMPTY);
}

// ============================================================================
// Event Decoding
// ============================================================================

#[test]
fn test_event_to_change() {
    let event = DomainEvent::from_payload(
        EventKind::Updated,
        &json!({"productId": "17", "rating": 5, "oldRating": 2}),
    )
    .unwrap();

    assert_eq!(event.entity_id.0, 17);
    assert_eq!(
        event.change().unwrap(),
        Change::Updated {
            previous: 2.0,
            value: 5.0
        }
    );
}

#[test]
fn test_update_without_previous_value_is_rejected() {
    let result = DomainEvent::from_payload(EventKind::Updated, &json!({"productId": 1, "rating": 5}))
        .and_then(|event| event.change());
    assert!(result.is_err());
}

// ============================================================================
// Agreement With Exact Aggregates
// ============================================================================

/// Small deterministic generator so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn rating(&mut self) -> f64 {
        (self.next() % 5 + 1) as f64
    }
}

fn exact(values: &[f64]) -> AggregateRecord {
    if values.is_empty() {
        return AggregateRecord::EMPTY;
    }
    AggregateRecord::new(values.iter().sum::<f64>() / values.len() as f64, values.len() as u64)
}

#[test]
fn test_random_sequences_match_exact_aggregate() {
    for seed in 1..=50u64 {
        let mut rng = Lcg(seed);
        let mut values: Vec<f64> = Vec::new();
        let mut record = AggregateRecord::EMPTY;

        for _ in 0..200 {
            let change = match (rng.next() % 3, values.is_empty()) {
                (0, _) | (_, true) => {
                    let value = rng.rating();
                    values.push(value);
                    Change::Added { value }
                }
                (1, false) => {
                    let index = rng.next() as usize % values.len();
                    let value = values.swap_remove(index);
                    Change::Removed { value }
                }
                _ => {
                    let index = rng.next() as usize % values.len();
                    let previous = values[index];
                    let value = rng.rating();
                    values[index] = value;
                    Change::Updated { previous, value }
                }
            };
            record = applied(record, change);

            let expected = exact(&values);
            assert_eq!(record.count, expected.count, "seed {}", seed);
            assert!(
                (record.mean - expected.mean).abs() < 1e-6,
                "seed {}: mean {} vs exact {}",
                seed,
                record.mean,
                expected.mean
            );
        }
    }
}

#[test]
fn test_draining_all_observations_returns_to_empty() {
    let values = [5.0, 1.0, 3.0, 4.0, 2.0];
    let mut record = AggregateRecord::EMPTY;
    for value in values {
        record = applied(record, Change::Added { value });
    }
    for value in values.iter().rev() {
        record = applied(record, Change::Removed { value: *value });
    }
    assert_eq!(record, AggregateRecord::EMPTY);
}
