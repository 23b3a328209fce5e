//! The running mean/count aggregate and its incremental arithmetic.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::event::Change;

/// Running mean and count of the observations for one entity.
///
/// `mean * count` is the sum of all counted observations; an empty aggregate
/// is exactly `(0, 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub mean: f64,
    pub count: u64,
}

/// Result of applying a change to an aggregate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ApplyOutcome {
    /// The aggregate after the change
    Updated(AggregateRecord),
    /// The change cannot apply to this aggregate; it must be left as is
    PreconditionViolated(&'static str),
}

impl AggregateRecord {
    pub const EMPTY: Self = Self { mean: 0.0, count: 0 };

    pub fn new(mean: f64, count: u64) -> Self {
        if count == 0 {
            return Self::EMPTY;
        }
        Self { mean, count }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Sum of the counted observations.
    pub fn sum(&self) -> f64 {
        self.mean * self.count as f64
    }

    /// Apply one change without touching any store.
    pub fn apply(&self, change: &Change) -> ApplyOutcome {
        match *change {
            Change::Added { value } => {
                let count = self.count + 1;
                ApplyOutcome::Updated(Self {
                    mean: (self.sum() + value) / count as f64,
                    count,
                })
            }
            Change::Removed { value } => {
                if self.count <= 1 {
                    return ApplyOutcome::Updated(Self::EMPTY);
                }
                let count = self.count - 1;
                ApplyOutcome::Updated(Self {
                    mean: (self.sum() - value) / count as f64,
                    count,
                })
            }
            Change::Updated { previous, value } => {
                if self.count == 0 {
                    return ApplyOutcome::PreconditionViolated("update on an empty aggregate");
                }
                ApplyOutcome::Updated(Self {
                    mean: (self.sum() - previous + value) / self.count as f64,
                    count: self.count,
                })
            }
        }
    }
}

impl Default for AggregateRecord {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Display for AggregateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mean={:.6} count={}", self.mean, self.count)
    }
}
