//! Approximate nearest-neighbor index trait.

use crate::config::AnnConfig;
use crate::models::RecordId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Construction parameters, fixed for the life of an index instance.
///
/// A snapshot may only be restored into an index with the same
/// `dimensions` and `max_elements`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnParams {
    /// Vector length.
    pub dimensions: usize,
    /// Capacity; inserts beyond it fail with [`Error::IndexFull`].
    pub max_elements: usize,
    /// Graph connectivity (M).
    pub m: usize,
    /// Build-time search breadth.
    pub ef_construction: usize,
    /// Query-time search breadth.
    pub ef: usize,
}

impl AnnParams {
    /// Builds parameters from configuration.
    #[must_use]
    pub const fn from_config(dimensions: usize, config: &AnnConfig) -> Self {
        Self {
            dimensions,
            max_elements: config.max_elements,
            m: config.m,
            ef_construction: config.ef_construction,
            ef: config.ef,
        }
    }
}

/// In-memory approximate k-NN over record embeddings.
///
/// Vectors are expected to be unit-normalized; scores are cosine
/// similarities. Mutating methods take `&mut self`: the structure is not
/// safe for concurrent mutation, and sharing goes through
/// [`SharedIndex`](crate::storage::SharedIndex), which holds the lock.
///
/// # Deletion
///
/// The graph cannot remove vectors. [`AnnIndex::delete`] logs that a rebuild
/// is required and reports `false`; callers track staleness instead.
pub trait AnnIndex: Send + Sync {
    /// Short backend name for logs and metrics.
    fn backend_name(&self) -> &'static str;

    /// Construction parameters.
    fn params(&self) -> &AnnParams;

    /// Vector length this index accepts.
    fn dimensions(&self) -> usize {
        self.params().dimensions
    }

    /// Maximum number of vectors.
    fn capacity(&self) -> usize {
        self.params().max_elements
    }

    /// Current element count; 0 when empty.
    fn count(&self) -> usize;

    /// Whether `id` has a vector in the index.
    fn contains(&self, id: RecordId) -> bool;

    /// Adds one vector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexFull`] at capacity,
    /// [`Error::DimensionMismatch`] for a wrong-length vector.
    fn insert(&mut self, vector: &[f32], id: RecordId) -> Result<()>;

    /// Adds several vectors, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the slices differ in length, or the
    /// first insert error.
    fn insert_many(&mut self, vectors: &[Vec<f32>], ids: &[RecordId]) -> Result<()> {
        if vectors.len() != ids.len() {
            return Err(Error::InvalidInput(format!(
                "insert_many got {} vectors for {} ids",
                vectors.len(),
                ids.len()
            )));
        }
        for (vector, &id) in vectors.iter().zip(ids) {
            self.insert(vector, id)?;
        }
        Ok(())
    }

    /// The `k` nearest ids with similarity scores, best first.
    ///
    /// Returns every element when the index holds fewer than `k`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] for a wrong-length query or
    /// [`Error::IndexUnavailable`] if the backend fails.
    fn query(&self, vector: &[f32], k: usize) -> Result<Vec<(RecordId, f32)>>;

    /// Deletion is unsupported; logs and returns `false`.
    ///
    /// # Errors
    ///
    /// Never fails in the default implementation.
    fn delete(&mut self, id: RecordId) -> Result<bool> {
        tracing::debug!(
            record_id = %id,
            backend = self.backend_name(),
            "ANN index does not support deletion; a full rebuild is required to remove vectors"
        );
        Ok(false)
    }

    /// Writes the whole index to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] on I/O or serialization failure.
    fn persist(&self, path: &Path) -> Result<()>;

    /// Replaces the contents with the snapshot at `path`.
    ///
    /// On failure the index is left as it was.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexUnavailable`] for a missing, corrupt or
    /// mismatched snapshot.
    fn restore(&mut self, path: &Path) -> Result<()>;
}
