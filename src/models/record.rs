//! Memory records.

use super::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned record identifier.
///
/// Assigned by the record store on creation; monotonically increasing, so
/// ordering by id is insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(i64);

impl RecordId {
    /// Wraps a raw row id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw row id.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Returns the id as an ANN index key.
    ///
    /// Row ids start at 1 and are never negative.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn as_key(self) -> u64 {
        self.0 as u64
    }

    /// Rebuilds an id from an ANN index key.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn from_key(key: u64) -> Self {
        Self(key as i64)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A record that has not been persisted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMemory {
    /// Session the record belongs to.
    pub session_id: SessionId,
    /// The user prompt.
    pub prompt_text: String,
    /// The model answer.
    pub answer_text: String,
    /// Optional condensed form of the exchange.
    pub summary_text: Option<String>,
    /// Embedding of length `EMBED_DIM`.
    pub embedding: Vec<f32>,
}

impl NewMemory {
    /// Creates a record without a summary.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        prompt_text: impl Into<String>,
        answer_text: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            session_id,
            prompt_text: prompt_text.into(),
            answer_text: answer_text.into(),
            summary_text: None,
            embedding,
        }
    }

    /// Attaches a summary.
    #[must_use]
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary_text = Some(summary.into());
        self
    }
}

/// A persisted prompt/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Store-assigned identifier.
    pub id: RecordId,
    /// Session the record belongs to.
    pub session_id: SessionId,
    /// The user prompt.
    pub prompt_text: String,
    /// The model answer.
    pub answer_text: String,
    /// Optional condensed form of the exchange.
    pub summary_text: Option<String>,
    /// Unit-normalized embedding.
    pub embedding: Vec<f32>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}
