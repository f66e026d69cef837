//! ANN index health.
//!
//! The graph cannot drop vectors, so deleting records leaves stale entries
//! behind. Rather than pretending to remove them, the index carries a health
//! tag and a rebuild policy decides when the staleness is worth a rebuild.

use serde::Serialize;
use std::fmt;

/// Whether the index still matches the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IndexHealth {
    /// Every indexed vector belongs to a live record.
    #[default]
    Fresh,
    /// Some indexed vectors belong to deleted records.
    NeedsRebuild {
        /// Number of stale vectors.
        stale: usize,
    },
}

impl IndexHealth {
    /// Adds `count` stale vectors.
    #[must_use]
    pub const fn with_stale(self, count: usize) -> Self {
        if count == 0 {
            return self;
        }
        Self::NeedsRebuild {
            stale: self.stale_count() + count,
        }
    }

    /// Number of stale vectors.
    #[must_use]
    pub const fn stale_count(self) -> usize {
        match self {
            Self::Fresh => 0,
            Self::NeedsRebuild { stale } => stale,
        }
    }

    /// True when no rebuild is pending.
    #[must_use]
    pub const fn is_fresh(self) -> bool {
        matches!(self, Self::Fresh)
    }
}

impl fmt::Display for IndexHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fresh => write!(f, "fresh"),
            Self::NeedsRebuild { stale } => write!(f, "needs rebuild ({stale} stale)"),
        }
    }
}

/// When stale entries trigger an automatic rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildPolicy {
    threshold: usize,
}

impl RebuildPolicy {
    /// Rebuild once `threshold` stale vectors accumulate; 0 disables.
    #[must_use]
    pub const fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    /// Never rebuild automatically.
    #[must_use]
    pub const fn manual() -> Self {
        Self { threshold: 0 }
    }

    /// Whether `health` calls for a rebuild.
    #[must_use]
    pub const fn should_rebuild(&self, health: IndexHealth) -> bool {
        self.threshold > 0 && health.stale_count() >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staleness_accumulates() {
        let health = IndexHealth::Fresh.with_stale(0);
        assert!(health.is_fresh());

        let health = health.with_stale(3).with_stale(2);
        assert_eq!(health, IndexHealth::NeedsRebuild { stale: 5 });
        assert_eq!(health.to_string(), "needs rebuild (5 stale)");
    }

    #[test]
    fn test_policy_threshold() {
        let policy = RebuildPolicy::new(4);
        assert!(!policy.should_rebuild(IndexHealth::Fresh));
        assert!(!policy.should_rebuild(IndexHealth::NeedsRebuild { stale: 3 }));
        assert!(policy.should_rebuild(IndexHealth::NeedsRebuild { stale: 4 }));
        assert!(!RebuildPolicy::manual().should_rebuild(IndexHealth::NeedsRebuild { stale: 100 }));
    }
}
