//! Durable record store trait.

use crate::Result;
use crate::models::{MemoryRecord, NewMemory, RecordId, ScoredRecord, SessionId};
use std::collections::BTreeSet;

/// The authoritative store of memory records.
///
/// The store is the only component that assigns [`RecordId`]s. Every
/// operation that writes more than one statement runs in a single
/// transaction, so a record is either fully present or absent.
///
/// # Implementor Notes
///
/// - Methods take `&self`; implementations share state through a connection pool
/// - Operations on an unknown session return empty results, never an error
pub trait RecordStore: Send + Sync {
    /// Embedding dimension enforced on every write and query.
    fn dimensions(&self) -> usize;

    /// Validates, normalizes and inserts a record, returning its new id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`](crate::Error::DimensionMismatch)
    /// or [`Error::InvalidVector`](crate::Error::InvalidVector) for a bad
    /// embedding, [`Error::PoolExhausted`](crate::Error::PoolExhausted) if no
    /// connection is available, or a storage failure.
    fn create(&self, memory: &NewMemory) -> Result<RecordId>;

    /// Records in a session in insertion order, oldest first, capped at `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error on pool exhaustion or storage failure.
    fn list_by_session(&self, session_id: &SessionId, limit: Option<usize>)
    -> Result<Vec<MemoryRecord>>;

    /// Records for `ids`, in the order requested. Unknown ids are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error on pool exhaustion or storage failure.
    fn get_many(&self, ids: &[RecordId]) -> Result<Vec<MemoryRecord>>;

    /// Exact cosine-similarity search over every candidate record.
    ///
    /// `query` must already be unit-normalized. Candidates are scoped to
    /// `session_id` when given. Ties are broken by most recent insertion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`](crate::Error::DimensionMismatch)
    /// for a wrong-length query, or a storage failure.
    fn scan_similar(
        &self,
        query: &[f32],
        session_id: Option<&SessionId>,
        top_k: usize,
    ) -> Result<Vec<ScoredRecord>>;

    /// Distinct session ids with at least one record.
    ///
    /// # Errors
    ///
    /// Returns an error on pool exhaustion or storage failure.
    fn all_session_ids(&self) -> Result<BTreeSet<SessionId>>;

    /// Whether the session has any records.
    ///
    /// # Errors
    ///
    /// Returns an error on pool exhaustion or storage failure.
    fn collection_exists(&self, session_id: &SessionId) -> Result<bool> {
        Ok(self.collection_size(session_id)? > 0)
    }

    /// Number of records in the session.
    ///
    /// # Errors
    ///
    /// Returns an error on pool exhaustion or storage failure.
    fn collection_size(&self, session_id: &SessionId) -> Result<usize>;

    /// Removes every record in the session, returning the removed ids.
    ///
    /// # Errors
    ///
    /// Returns an error on pool exhaustion or storage failure; nothing is
    /// removed in that case.
    fn delete_collection(&self, session_id: &SessionId) -> Result<Vec<RecordId>>;

    /// Total number of records.
    ///
    /// # Errors
    ///
    /// Returns an error on pool exhaustion or storage failure.
    fn count(&self) -> Result<usize>;
}
