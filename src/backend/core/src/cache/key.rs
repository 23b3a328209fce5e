//! Cache key and field naming.

use std::fmt;

use crate::aggregate::EntityId;

/// Hash field holding the mean, as a decimal string.
pub const FIELD_MEAN: &str = "averageRating";
/// Hash field holding the count, as an integer string.
pub const FIELD_COUNT: &str = "reviewCount";
/// Hash field holding the entry version used for compare-and-set.
pub const FIELD_VERSION: &str = "version";

/// Builds `{prefix}:{entity_id}` keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches(':').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn entity(&self, id: EntityId) -> String {
        format!("{}:{}", self.prefix, id)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("product")
    }
}

impl fmt::Display for KeySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:*", self.prefix)
    }
}
