//! Search result types.

use super::MemoryRecord;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A record paired with its cosine similarity to a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    /// The matched record.
    pub record: MemoryRecord,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
}

impl ScoredRecord {
    /// Ranking order: higher score first, ties broken by most recent
    /// insertion (higher id) first.
    #[must_use]
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| other.record.id.cmp(&self.record.id))
    }

    /// Sorts `results` into ranking order and keeps the first `top_k`.
    pub fn rank(results: &mut Vec<Self>, top_k: usize) {
        results.sort_by(Self::rank_cmp);
        results.truncate(top_k);
    }
}
