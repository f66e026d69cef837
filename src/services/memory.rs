//! Memory service.
//!
//! The entry point the API layer calls. Owns the record store, the shared
//! ANN index and the retrieval coordinator, and manages their lifecycle:
//!
//! ```text
//! open ──▶ bootstrap ──▶ create / find / delete ... ──▶ shutdown (persist)
//! ```
//!
//! Writes go store first, then index; the store is authoritative and the
//! index is always rebuildable from it.

use crate::config::MemvaultConfig;
use crate::embedding::VectorCodec;
use crate::models::{MemoryRecord, NewMemory, RecordId, ScoredRecord, SessionId};
use crate::services::{BootstrapReport, IndexBootstrapper, RetrievalCoordinator, SimilarityCache};
use crate::storage::sqlite::acquire_lock;
use crate::storage::vector::new_index;
use crate::storage::{
    AnnParams, IndexHealth, RebuildPolicy, RecordStore, SharedIndex, SqliteRecordStore,
};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use tracing::instrument;

/// Point-in-time view of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    /// Records in the store.
    pub records: usize,
    /// Distinct sessions in the store.
    pub sessions: usize,
    /// Schema version of the record store.
    pub schema_version: i32,
    /// ANN backend name.
    pub index_backend: &'static str,
    /// Vectors in the ANN index, stale ones included.
    pub index_count: usize,
    /// ANN capacity.
    pub index_capacity: usize,
    /// ANN health.
    pub index_health: IndexHealth,
    /// Entries in the similarity cache.
    pub cache_entries: usize,
    /// Record database path.
    pub database_path: PathBuf,
    /// Snapshot path.
    pub snapshot_path: PathBuf,
    /// How the index was last populated.
    pub last_bootstrap: Option<BootstrapReport>,
}

/// Embedding storage and retrieval engine.
pub struct MemoryService {
    config: MemvaultConfig,
    codec: VectorCodec,
    store: Arc<SqliteRecordStore>,
    index: Arc<SharedIndex>,
    bootstrapper: IndexBootstrapper,
    coordinator: RetrievalCoordinator,
    policy: RebuildPolicy,
    /// Writers share it; a rebuild holds it exclusively so no record lands
    /// in the index being replaced.
    write_gate: RwLock<()>,
    last_bootstrap: Mutex<Option<BootstrapReport>>,
}

impl MemoryService {
    /// Opens the store, then restores or backfills the ANN index.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the store cannot
    /// be opened, or the backfill fails.
    #[instrument(skip(config), fields(operation = "open", data_dir = %config.data_dir.display()))]
    pub fn open(config: MemvaultConfig) -> Result<Self> {
        config.validate()?;

        let dim = config.embed_dim;
        let store = Arc::new(SqliteRecordStore::open(config.database_path(), dim, config.pool)?);
        let params = AnnParams::from_config(dim, &config.ann);
        let index = Arc::new(SharedIndex::new(new_index(params)?));

        let dyn_store: Arc<dyn RecordStore> = store.clone();
        let bootstrapper =
            IndexBootstrapper::new(Arc::clone(&dyn_store), params, Some(config.snapshot_path()));
        let report = bootstrapper.bootstrap(&index)?;

        let codec = VectorCodec::new(dim);
        let coordinator = RetrievalCoordinator::with_ann(
            codec,
            dyn_store,
            Arc::clone(&index),
            SimilarityCache::from_config(&config.cache),
        );

        tracing::info!(
            embed_dim = dim,
            backend = index.backend_name(),
            indexed = report.indexed,
            skipped = report.skipped,
            "Memory service ready"
        );

        Ok(Self {
            policy: RebuildPolicy::new(config.ann.rebuild_stale_threshold),
            config,
            codec,
            store,
            index,
            bootstrapper,
            coordinator,
            write_gate: RwLock::new(()),
            last_bootstrap: Mutex::new(Some(report)),
        })
    }

    /// The configuration the service was opened with.
    #[must_use]
    pub const fn config(&self) -> &MemvaultConfig {
        &self.config
    }

    /// The record store.
    #[must_use]
    pub fn store(&self) -> &SqliteRecordStore {
        &self.store
    }

    /// The shared ANN index.
    #[must_use]
    pub fn index(&self) -> &SharedIndex {
        &self.index
    }

    /// Stores a new exchange and indexes its embedding.
    ///
    /// With `coerce_embeddings` set, a wrong-length or non-finite embedding
    /// is sanitized (and logged) instead of rejected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for oversized text,
    /// [`Error::DimensionMismatch`] or [`Error::InvalidVector`] for a bad
    /// embedding, [`Error::IndexFull`] when the index has no room,
    /// [`Error::PoolExhausted`] or a storage failure.
    #[instrument(
        skip(self, memory),
        fields(
            operation = "create_memory",
            session_id = %memory.session_id,
            record_id = tracing::field::Empty
        )
    )]
    pub fn create_memory(&self, memory: NewMemory) -> Result<RecordId> {
        self.check_text_bounds(&memory)?;

        let embedding = if self.config.coerce_embeddings {
            self.codec.prepare_lenient(&memory.embedding)?
        } else {
            self.codec.prepare(&memory.embedding)?
        };
        let memory = NewMemory { embedding, ..memory };

        let _gate = self.shared_gate();
        let slot = self.index.reserve_slot()?;

        let id = self.store.create(&memory)?;
        tracing::Span::current().record("record_id", id.get());

        // Invalidate only once the index can serve the new record.
        let indexed = slot.insert(&memory.embedding, id);
        self.coordinator.invalidate();
        if let Err(e) = indexed {
            tracing::error!(
                record_id = %id,
                error = %e,
                "Record stored but not indexed; it is reachable only through exact scan until a rebuild"
            );
            return Err(e);
        }
        Ok(id)
    }

    /// Records in a session, oldest first, capped at `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] or a storage failure.
    pub fn get_session_memories(
        &self,
        session_id: &SessionId,
        limit: Option<usize>,
    ) -> Result<Vec<MemoryRecord>> {
        self.store.list_by_session(session_id, limit)
    }

    /// The `top_k` records most similar to `query`, optionally within a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for `top_k == 0`,
    /// [`Error::DimensionMismatch`] or [`Error::InvalidVector`] for a bad
    /// query, [`Error::PoolExhausted`] or a storage failure.
    pub fn find_similar(
        &self,
        query: &[f32],
        session_id: Option<&SessionId>,
        top_k: usize,
    ) -> Result<Vec<ScoredRecord>> {
        if self.config.coerce_embeddings {
            let query = self.codec.prepare_lenient(query)?;
            return self.coordinator.find_similar(&query, session_id, top_k);
        }
        self.coordinator.find_similar(query, session_id, top_k)
    }

    /// Distinct sessions with at least one record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] or a storage failure.
    pub fn list_sessions(&self) -> Result<BTreeSet<SessionId>> {
        self.store.all_session_ids()
    }

    /// Whether the session has any records.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] or a storage failure.
    pub fn session_exists(&self, session_id: &SessionId) -> Result<bool> {
        self.store.collection_exists(session_id)
    }

    /// Number of records in the session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] or a storage failure.
    pub fn session_size(&self, session_id: &SessionId) -> Result<usize> {
        self.store.collection_size(session_id)
    }

    /// Deletes every record in the session and returns how many were removed.
    ///
    /// The ANN index cannot drop vectors, so the removed ids are marked
    /// stale; the index is rebuilt once the rebuild policy says so. A failed
    /// rebuild is logged and leaves the index stale but usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] or a storage failure.
    #[instrument(skip(self), fields(operation = "delete_session", session_id = %session_id))]
    pub fn delete_session(&self, session_id: &SessionId) -> Result<usize> {
        let (removed, health) = {
            let _gate = self.shared_gate();
            let removed = self.store.delete_collection(session_id)?;
            if removed.is_empty() {
                return Ok(0);
            }
            self.coordinator.invalidate();
            (removed.len(), self.index.mark_deleted(&removed))
        };

        if self.policy.should_rebuild(health) {
            tracing::info!(health = %health, "Stale threshold reached, rebuilding ANN index");
            if let Err(e) = self.rebuild_index() {
                tracing::warn!(error = %e, "ANN rebuild after delete failed; index left stale");
            }
        }
        Ok(removed)
    }

    /// Rebuilds the ANN index from the store, dropping stale vectors.
    ///
    /// Writes wait until the new index is swapped in.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexFull`] if the store outgrew the capacity, or a
    /// storage failure; the old index stays in place on error.
    #[instrument(skip(self), fields(operation = "rebuild_index"))]
    pub fn rebuild_index(&self) -> Result<BootstrapReport> {
        let _gate = self.write_gate.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Write gate was poisoned, recovering");
            poisoned.into_inner()
        });
        let report = self.bootstrapper.rebuild(&self.index)?;
        self.coordinator.invalidate();
        *acquire_lock(&self.last_bootstrap) = Some(report.clone());
        Ok(report)
    }

    /// Writes the ANN snapshot to the configured path.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be serialized or written.
    pub fn persist_index(&self) -> Result<PathBuf> {
        let path = self.config.snapshot_path();
        self.persist_index_to(&path)?;
        Ok(path)
    }

    /// Writes the ANN snapshot to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be serialized or written.
    pub fn persist_index_to(&self, path: &Path) -> Result<()> {
        if !self.index.health().is_fresh() {
            tracing::warn!(
                health = %self.index.health(),
                "Persisting an ANN index that still holds stale vectors"
            );
        }
        self.index.persist(path)
    }

    /// Current counts, index health and bootstrap outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] or a storage failure.
    pub fn status(&self) -> Result<ServiceStatus> {
        let params = self.index.params();
        Ok(ServiceStatus {
            records: self.store.count()?,
            sessions: self.store.all_session_ids()?.len(),
            schema_version: self.store.schema_version()?,
            index_backend: self.index.backend_name(),
            index_count: self.index.count(),
            index_capacity: params.max_elements,
            index_health: self.index.health(),
            cache_entries: self.coordinator.cache().map_or(0, SimilarityCache::len),
            database_path: self.config.database_path(),
            snapshot_path: self.config.snapshot_path(),
            last_bootstrap: acquire_lock(&self.last_bootstrap).clone(),
        })
    }

    /// Persists the index snapshot and releases the service.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    #[instrument(skip(self), fields(operation = "shutdown"))]
    pub fn shutdown(self) -> Result<()> {
        let path = self.persist_index()?;
        tracing::info!(
            path = %path.display(),
            indexed = self.index.count(),
            "Memory service shut down"
        );
        Ok(())
    }

    fn shared_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.write_gate.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Write gate was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn check_text_bounds(&self, memory: &NewMemory) -> Result<()> {
        let max = self.config.max_text_len;
        let fields = [
            ("prompt_text", Some(memory.prompt_text.as_str())),
            ("answer_text", Some(memory.answer_text.as_str())),
            ("summary_text", memory.summary_text.as_deref()),
        ];
        for (name, value) in fields {
            if let Some(text) = value
                && text.len() > max
            {
                return Err(Error::InvalidInput(format!(
                    "{name} is {} bytes, limit is {max}",
                    text.len()
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryService")
            .field("store", &self.store)
            .field("index", &self.index)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DIM: usize = 4;

    fn config(dir: &TempDir) -> MemvaultConfig {
        let mut config = MemvaultConfig::default()
            .with_data_dir(dir.path())
            .with_embed_dim(DIM);
        config.ann.max_elements = 100;
        config.ann.ef_construction = 32;
        config.ann.m = 8;
        config
    }

    fn session(raw: &str) -> SessionId {
        SessionId::parse(raw).unwrap()
    }

    fn memory(raw: &str, embedding: Vec<f32>) -> NewMemory {
        NewMemory::new(session(raw), "prompt", "answer", embedding)
    }

    #[test]
    fn test_create_indexes_and_finds() {
        let dir = TempDir::new().unwrap();
        let service = MemoryService::open(config(&dir)).unwrap();

        let id = service
            .create_memory(memory("demo", vec![3.0, 0.0, 0.0, 0.0]))
            .unwrap();
        assert!(service.index().contains(id));

        let hits = service
            .find_similar(&[1.0, 0.0, 0.0, 0.0], Some(&session("demo")), 1)
            .unwrap();
        assert_eq!(hits[0].record.id, id);
        assert!((hits[0].score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_text_bounds() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.max_text_len = 4;
        let service = MemoryService::open(config).unwrap();

        let long = NewMemory::new(session("s"), "prompt", "ok", vec![1.0, 0.0, 0.0, 0.0]);
        assert!(matches!(
            service.create_memory(long),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(service.store().count().unwrap(), 0);
    }

    #[test]
    fn test_coercion_pads_short_embeddings() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.coerce_embeddings = true;
        let service = MemoryService::open(config).unwrap();

        let id = service.create_memory(memory("s", vec![1.0, 0.0])).unwrap();
        let stored = service.get_session_memories(&session("s"), None).unwrap();
        assert_eq!(stored[0].id, id);
        assert_eq!(stored[0].embedding.len(), DIM);
    }

    #[test]
    fn test_strict_mode_rejects_short_embeddings() {
        let dir = TempDir::new().unwrap();
        let service = MemoryService::open(config(&dir)).unwrap();
        assert!(matches!(
            service.create_memory(memory("s", vec![1.0, 0.0])),
            Err(Error::DimensionMismatch {
                expected: DIM,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_delete_session_rebuilds_index() {
        let dir = TempDir::new().unwrap();
        let service = MemoryService::open(config(&dir)).unwrap();
        service
            .create_memory(memory("keep", vec![1.0, 0.0, 0.0, 0.0]))
            .unwrap();
        service
            .create_memory(memory("drop", vec![0.0, 1.0, 0.0, 0.0]))
            .unwrap();

        assert_eq!(service.delete_session(&session("drop")).unwrap(), 1);
        assert!(!service.session_exists(&session("drop")).unwrap());
        assert_eq!(service.session_size(&session("drop")).unwrap(), 0);
        assert!(service.index().health().is_fresh());
        assert_eq!(service.index().count(), 1);

        assert_eq!(service.delete_session(&session("drop")).unwrap(), 0);
    }

    #[test]
    fn test_manual_policy_leaves_index_stale() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.ann.rebuild_stale_threshold = 0;
        let service = MemoryService::open(config).unwrap();
        service
            .create_memory(memory("drop", vec![0.0, 1.0, 0.0, 0.0]))
            .unwrap();

        service.delete_session(&session("drop")).unwrap();
        assert_eq!(
            service.index().health(),
            IndexHealth::NeedsRebuild { stale: 1 }
        );
        let hits = service.find_similar(&[0.0, 1.0, 0.0, 0.0], None, 3).unwrap();
        assert!(hits.is_empty());

        let report = service.rebuild_index().unwrap();
        assert_eq!(report.indexed, 0);
        assert!(service.index().health().is_fresh());
    }

    #[test]
    fn test_shutdown_persists_and_reopen_restores() {
        let dir = TempDir::new().unwrap();
        let service = MemoryService::open(config(&dir)).unwrap();
        service
            .create_memory(memory("s", vec![0.0, 0.0, 1.0, 0.0]))
            .unwrap();
        service.shutdown().unwrap();

        let reopened = MemoryService::open(config(&dir)).unwrap();
        let status = reopened.status().unwrap();
        assert_eq!(status.records, 1);
        assert_eq!(status.index_count, 1);
        assert!(matches!(
            status.last_bootstrap.map(|r| r.outcome),
            Some(crate::services::BootstrapOutcome::Restored)
        ));
    }

    #[test]
    fn test_index_full_rejected_before_write() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.ann.max_elements = 1;
        let service = MemoryService::open(config).unwrap();
        service
            .create_memory(memory("s", vec![1.0, 0.0, 0.0, 0.0]))
            .unwrap();
        assert!(matches!(
            service.create_memory(memory("s", vec![0.0, 1.0, 0.0, 0.0])),
            Err(Error::IndexFull { capacity: 1 })
        ));
        assert_eq!(service.store().count().unwrap(), 1);
    }
}
