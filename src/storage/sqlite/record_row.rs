//! Row conversion for the `memories` table.

use crate::embedding::decode;
use crate::models::{MemoryRecord, RecordId, SessionId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::Row;

/// Column list matching [`RecordRow::from_row`].
pub const RECORD_COLUMNS: &str =
    "id, session_id, prompt_text, answer_text, summary_text, embedding, created_at";

/// A `memories` row with every column in its stored type.
#[derive(Debug)]
pub struct RecordRow {
    /// Auto-assigned row id.
    pub id: i64,
    /// Session grouping key.
    pub session_id: String,
    /// Prompt text.
    pub prompt_text: String,
    /// Answer text.
    pub answer_text: String,
    /// Optional summary.
    pub summary_text: Option<String>,
    /// Little-endian `f32` embedding blob.
    pub embedding: Vec<u8>,
    /// Unix milliseconds.
    pub created_at: i64,
}

impl RecordRow {
    /// Reads a row selected with [`RECORD_COLUMNS`].
    ///
    /// # Errors
    ///
    /// Returns the underlying `rusqlite` error for a type mismatch.
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            prompt_text: row.get(2)?,
            answer_text: row.get(3)?,
            summary_text: row.get(4)?,
            embedding: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    /// Converts into a [`MemoryRecord`].
    ///
    /// A blob that is not a whole number of `f32`s, or that holds a NaN or
    /// infinite component, is logged and yields an empty embedding, so one
    /// corrupt row never hides the rest of a session. Callers that need the
    /// vector check its length.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if the stored session id is not
    /// valid, which means the table was written by something else.
    pub fn into_record(self) -> Result<MemoryRecord> {
        let session_id = SessionId::parse(self.session_id)
            .map_err(|e| Error::op("decode_session_id", format!("record {}: {e}", self.id)))?;

        let embedding = match decode(&self.embedding) {
            Ok(vector) if vector.iter().all(|x| x.is_finite()) => vector,
            Ok(_) => corrupt_embedding(self.id, "non-finite component"),
            Err(e) => corrupt_embedding(self.id, e),
        };

        Ok(MemoryRecord {
            id: RecordId::new(self.id),
            session_id,
            prompt_text: self.prompt_text,
            answer_text: self.answer_text,
            summary_text: self.summary_text,
            embedding,
            created_at: DateTime::<Utc>::from_timestamp_millis(self.created_at)
                .unwrap_or_default(),
        })
    }
}

fn corrupt_embedding(id: i64, error: impl std::fmt::Display) -> Vec<f32> {
    tracing::warn!(record_id = id, error = %error, "Corrupt embedding blob");
    metrics::counter!("storage_corrupt_embeddings_total").increment(1);
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::encode;

    fn row(embedding: Vec<u8>) -> RecordRow {
        RecordRow {
            id: 7,
            session_id: "demo".to_string(),
            prompt_text: "q".to_string(),
            answer_text: "a".to_string(),
            summary_text: Some("s".to_string()),
            embedding,
            created_at: 1_700_000_000_123,
        }
    }

    #[test]
    fn test_into_record() {
        let record = row(encode(&[1.0, 0.0])).into_record().unwrap();
        assert_eq!(record.id, RecordId::new(7));
        assert_eq!(record.session_id.as_str(), "demo");
        assert_eq!(record.embedding, vec![1.0, 0.0]);
        assert_eq!(record.summary_text.as_deref(), Some("s"));
        assert_eq!(record.created_at.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn test_corrupt_blob_yields_empty_embedding() {
        let record = row(vec![1, 2, 3]).into_record().unwrap();
        assert!(record.embedding.is_empty());
    }

    #[test]
    fn test_non_finite_blob_yields_empty_embedding() {
        for bad in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let record = row(encode(&[bad, 0.0])).into_record().unwrap();
            assert!(record.embedding.is_empty());
        }
    }

    #[test]
    fn test_invalid_session_is_error() {
        let mut bad = row(encode(&[1.0]));
        bad.session_id = "no spaces".to_string();
        assert!(bad.into_record().is_err());
    }
}
