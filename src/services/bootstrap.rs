//! ANN index bootstrap.
//!
//! On startup the index is either restored from its snapshot or rebuilt
//! from the record store:
//!
//! ```text
//! snapshot present ──restore ok──▶ Restored
//!        │
//!        └─absent / restore failed──▶ backfill ──▶ Backfilled
//! ```
//!
//! A record whose embedding cannot be indexed is logged and skipped; the
//! rest of the corpus is still indexed.

use crate::models::{MemoryRecord, RecordId};
use crate::storage::vector::new_index;
use crate::storage::{AnnIndex, AnnParams, RecordStore, SharedIndex};
use crate::{Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

/// Records inserted per index write.
const BACKFILL_BATCH: usize = 256;

/// How the index reached its ready state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BootstrapOutcome {
    /// Loaded from the snapshot.
    Restored,
    /// Rebuilt from the record store.
    Backfilled {
        /// Why the snapshot was not used.
        reason: String,
    },
}

/// Result of a bootstrap or rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    /// Restore or backfill.
    pub outcome: BootstrapOutcome,
    /// Vectors in the index afterwards.
    pub indexed: usize,
    /// Records skipped during backfill.
    pub skipped: usize,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
}

/// Populates a [`SharedIndex`] at startup and on rebuild.
pub struct IndexBootstrapper {
    store: Arc<dyn RecordStore>,
    params: AnnParams,
    snapshot_path: Option<PathBuf>,
}

impl IndexBootstrapper {
    /// Creates a bootstrapper; `snapshot_path` of `None` always backfills.
    #[must_use]
    pub fn new(
        store: Arc<dyn RecordStore>,
        params: AnnParams,
        snapshot_path: Option<PathBuf>,
    ) -> Self {
        Self {
            store,
            params,
            snapshot_path,
        }
    }

    /// Snapshot location, if any.
    #[must_use]
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Restores `index` from the snapshot, falling back to a full backfill.
    ///
    /// # Errors
    ///
    /// Restore failures are recovered. Errors come only from the backfill:
    /// store failures or [`Error::IndexFull`].
    #[instrument(skip(self, index), fields(operation = "bootstrap"))]
    pub fn bootstrap(&self, index: &SharedIndex) -> Result<BootstrapReport> {
        let start = Instant::now();
        let reason = match &self.snapshot_path {
            None => "no snapshot configured".to_string(),
            Some(path) if !path.exists() => {
                tracing::info!(path = %path.display(), "No ANN snapshot found, backfilling");
                "snapshot absent".to_string()
            },
            Some(path) => match index.restore(path) {
                Ok(()) => {
                    let indexed = index.count();
                    self.log_restored(indexed);
                    return Ok(BootstrapReport {
                        outcome: BootstrapOutcome::Restored,
                        indexed,
                        skipped: 0,
                        duration_ms: elapsed_ms(start),
                    });
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "ANN snapshot restore failed, falling back to full backfill"
                    );
                    metrics::counter!("bootstrap_restore_failures_total").increment(1);
                    format!("restore failed: {e}")
                },
            },
        };

        let mut report = self.rebuild(index)?;
        report.outcome = BootstrapOutcome::Backfilled { reason };
        report.duration_ms = elapsed_ms(start);
        Ok(report)
    }

    /// Backfills a fresh index from the store and swaps it into `index`.
    ///
    /// Readers keep using the old index until the swap.
    ///
    /// # Errors
    ///
    /// Returns store failures or [`Error::IndexFull`]; `index` is left
    /// untouched on error.
    #[instrument(skip(self, index), fields(operation = "rebuild"))]
    pub fn rebuild(&self, index: &SharedIndex) -> Result<BootstrapReport> {
        let start = Instant::now();
        let mut fresh = new_index(self.params)?;
        let (indexed, skipped) = self.backfill(fresh.as_mut())?;
        index.replace(fresh);

        tracing::info!(indexed, skipped, "ANN index backfilled from record store");
        Ok(BootstrapReport {
            outcome: BootstrapOutcome::Backfilled {
                reason: "rebuild requested".to_string(),
            },
            indexed,
            skipped,
            duration_ms: elapsed_ms(start),
        })
    }

    /// Replays every stored vector into `index`; returns (indexed, skipped).
    fn backfill(&self, index: &mut dyn AnnIndex) -> Result<(usize, usize)> {
        let dims = index.dimensions();
        let mut indexed = 0usize;
        let mut skipped = 0usize;
        let stored = self.store.count()?;

        for session in self.store.all_session_ids()? {
            let records = self.store.list_by_session(&session, None)?;
            let mut vectors = Vec::with_capacity(BACKFILL_BATCH);
            let mut ids = Vec::with_capacity(BACKFILL_BATCH);

            for record in records {
                if !indexable(&record, dims) {
                    skipped += 1;
                    continue;
                }
                let MemoryRecord { id, embedding, .. } = record;
                vectors.push(embedding);
                ids.push(id);
                if vectors.len() == BACKFILL_BATCH {
                    indexed += flush(index, &mut vectors, &mut ids)?;
                }
            }
            indexed += flush(index, &mut vectors, &mut ids)?;
        }

        // Rows under a malformed session id never show up in a session
        // listing. Rows created mid-backfill can hide some of them.
        let unreachable = stored.saturating_sub(indexed + skipped);
        if unreachable > 0 {
            tracing::warn!(unreachable, "Skipped records stored under malformed session ids");
            skipped += unreachable;
        }

        if skipped > 0 {
            metrics::counter!("bootstrap_skipped_records_total").increment(skipped as u64);
            tracing::warn!(skipped, "Skipped records with unusable embeddings during backfill");
        }
        Ok((indexed, skipped))
    }

    fn log_restored(&self, indexed: usize) {
        match self.store.count() {
            Ok(stored) if stored != indexed => tracing::warn!(
                indexed,
                stored,
                "Restored ANN snapshot differs from the record store; run a rebuild to resync"
            ),
            Ok(_) => tracing::info!(indexed, "ANN index restored from snapshot"),
            Err(e) => tracing::warn!(indexed, error = %e, "Could not count stored records"),
        }
    }
}

fn indexable(record: &MemoryRecord, dims: usize) -> bool {
    if record.embedding.len() != dims {
        tracing::warn!(
            record_id = %record.id,
            session_id = %record.session_id,
            expected = dims,
            actual = record.embedding.len(),
            "Skipping record with mismatched embedding dimension"
        );
        return false;
    }
    if record.embedding.iter().any(|x| !x.is_finite()) {
        tracing::warn!(
            record_id = %record.id,
            session_id = %record.session_id,
            "Skipping record with non-finite embedding"
        );
        return false;
    }
    true
}

fn flush(
    index: &mut dyn AnnIndex,
    vectors: &mut Vec<Vec<f32>>,
    ids: &mut Vec<RecordId>,
) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let before = index.count();
    if let Err(e) = index.insert_many(vectors, ids) {
        if matches!(e, Error::IndexFull { .. }) {
            tracing::error!(error = %e, "ANN capacity exhausted during backfill");
        }
        return Err(e);
    }
    vectors.clear();
    ids.clear();
    Ok(index.count() - before)
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
