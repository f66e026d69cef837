//! Process-wide handle to the ANN index.
//!
//! The index structure is not safe for concurrent mutation, so every access
//! goes through one `RwLock`: queries share the read lock, inserts take the
//! write lock, and `persist` holds the read lock so no insert can tear the
//! snapshot. The lock also guards the index's [`IndexHealth`] and the
//! count of reserved slots, so a capacity check and the insert that follows
//! it cannot interleave with another writer's.

use super::health::IndexHealth;
use crate::{Error, Result};
use crate::models::RecordId;
use crate::storage::traits::{AnnIndex, AnnParams};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::instrument;

struct IndexState {
    index: Box<dyn AnnIndex>,
    health: IndexHealth,
    reserved: usize,
}

/// Thread-safe ANN index with health tracking.
pub struct SharedIndex {
    state: RwLock<IndexState>,
}

impl std::fmt::Debug for SharedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("SharedIndex")
            .field("backend", &state.index.backend_name())
            .field("count", &state.index.count())
            .field("health", &state.health)
            .field("reserved", &state.reserved)
            .finish()
    }
}

impl SharedIndex {
    /// Wraps `index` as fresh.
    #[must_use]
    pub fn new(index: Box<dyn AnnIndex>) -> Self {
        let shared = Self {
            state: RwLock::new(IndexState {
                index,
                health: IndexHealth::Fresh,
                reserved: 0,
            }),
        };
        shared.publish_size();
        shared
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(|poisoned| {
            tracing::warn!("ANN index lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(|poisoned| {
            tracing::warn!("ANN index lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish_size(&self) {
        metrics::gauge!("ann_index_size").set(self.count() as f64);
    }

    /// Backend name of the wrapped index.
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.read().index.backend_name()
    }

    /// Construction parameters of the wrapped index.
    #[must_use]
    pub fn params(&self) -> AnnParams {
        *self.read().index.params()
    }

    /// Current element count, including stale vectors.
    #[must_use]
    pub fn count(&self) -> usize {
        self.read().index.count()
    }

    /// Whether `id` has a vector in the index.
    #[must_use]
    pub fn contains(&self, id: RecordId) -> bool {
        self.read().index.contains(id)
    }

    /// Current health.
    #[must_use]
    pub fn health(&self) -> IndexHealth {
        self.read().health
    }

    /// Inserts one vector under the write lock.
    ///
    /// # Errors
    ///
    /// See [`AnnIndex::insert`].
    pub fn insert(&self, vector: &[f32], id: RecordId) -> Result<()> {
        let result = self.write().index.insert(vector, id);
        self.publish_size();
        result
    }

    /// Claims room for one insert that is still to come.
    ///
    /// Held slots count against capacity until they are filled with
    /// [`SlotReservation::insert`] or dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexFull`] when indexed vectors plus held slots
    /// already reach capacity.
    pub fn reserve_slot(&self) -> Result<SlotReservation<'_>> {
        let mut state = self.write();
        let capacity = state.index.params().max_elements;
        if state.index.count() + state.reserved >= capacity {
            return Err(Error::IndexFull { capacity });
        }
        state.reserved += 1;
        Ok(SlotReservation {
            shared: self,
            held: true,
        })
    }

    /// Inserts several vectors under one write lock.
    ///
    /// # Errors
    ///
    /// See [`AnnIndex::insert_many`].
    pub fn insert_many(&self, vectors: &[Vec<f32>], ids: &[RecordId]) -> Result<()> {
        let result = self.write().index.insert_many(vectors, ids);
        self.publish_size();
        result
    }

    /// Nearest ids under the read lock.
    ///
    /// # Errors
    ///
    /// See [`AnnIndex::query`].
    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<(RecordId, f32)>> {
        self.read().index.query(vector, k)
    }

    /// Records that `ids` were deleted from the store.
    ///
    /// The vectors stay in the graph; each one that was indexed counts as
    /// stale. Returns the new health.
    #[instrument(skip(self, ids), fields(operation = "mark_deleted", count = ids.len()))]
    pub fn mark_deleted(&self, ids: &[RecordId]) -> IndexHealth {
        let mut state = self.write();
        let mut stale = 0usize;
        for &id in ids {
            if !state.index.contains(id) {
                continue;
            }
            match state.index.delete(id) {
                Ok(true) => {},
                Ok(false) => stale += 1,
                Err(e) => {
                    tracing::warn!(record_id = %id, error = %e, "ANN delete failed");
                    stale += 1;
                },
            }
        }
        state.health = state.health.with_stale(stale);

        if stale > 0 {
            metrics::counter!("ann_index_stale_total").increment(stale as u64);
            tracing::warn!(
                stale,
                health = %state.health,
                "Deleted records remain in the ANN index until it is rebuilt"
            );
        }
        state.health
    }

    /// Writes a snapshot while holding the read lock.
    ///
    /// # Errors
    ///
    /// See [`AnnIndex::persist`].
    #[instrument(skip(self), fields(operation = "persist", path = %path.display()))]
    pub fn persist(&self, path: &Path) -> Result<()> {
        self.read().index.persist(path)
    }

    /// Restores from a snapshot; the index is fresh on success.
    ///
    /// # Errors
    ///
    /// See [`AnnIndex::restore`].
    #[instrument(skip(self), fields(operation = "restore", path = %path.display()))]
    pub fn restore(&self, path: &Path) -> Result<()> {
        let result = {
            let mut state = self.write();
            let result = state.index.restore(path);
            if result.is_ok() {
                state.health = IndexHealth::Fresh;
            }
            result
        };
        self.publish_size();
        result
    }

    /// Swaps in a rebuilt index and marks it fresh.
    pub fn replace(&self, index: Box<dyn AnnIndex>) {
        {
            let mut state = self.write();
            state.index = index;
            state.health = IndexHealth::Fresh;
        }
        self.publish_size();
    }
}

/// One slot of ANN capacity, released on drop if never filled.
#[must_use = "an unused reservation only holds capacity until dropped"]
pub struct SlotReservation<'a> {
    shared: &'a SharedIndex,
    held: bool,
}

impl SlotReservation<'_> {
    /// Fills the slot with `vector` under `id`.
    ///
    /// The slot is given back whatever the outcome.
    ///
    /// # Errors
    ///
    /// See [`AnnIndex::insert`].
    pub fn insert(mut self, vector: &[f32], id: RecordId) -> Result<()> {
        let result = {
            let mut state = self.shared.write();
            state.reserved = state.reserved.saturating_sub(1);
            self.held = false;
            state.index.insert(vector, id)
        };
        self.shared.publish_size();
        result
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if self.held {
            let mut state = self.shared.write();
            state.reserved = state.reserved.saturating_sub(1);
        }
    }
}
