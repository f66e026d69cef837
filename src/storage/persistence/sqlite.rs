//! `SQLite`-backed record store.
//!
//! The single source of truth for memory records. Every call checks a
//! connection out of a bounded [`ConnectionPool`]; writes run inside
//! `BEGIN IMMEDIATE` transactions so a record is either fully written or
//! not at all.

use crate::config::PoolConfig;
use crate::embedding::{VectorCodec, dot};
use crate::models::{MemoryRecord, NewMemory, RecordId, ScoredRecord, SessionId};
use crate::storage::migrations::{MEMORY_MIGRATIONS, MigrationRunner, current_version};
use crate::storage::sqlite::{
    ConnectionPool, RECORD_COLUMNS, RecordRow, record_operation_metrics, status_of,
};
use crate::storage::traits::RecordStore;
use crate::{Error, Result};
use rusqlite::{Connection, params, params_from_iter};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::instrument;

const BACKEND: &str = "sqlite";

/// Maximum bound parameters per `IN (...)` batch.
const GET_MANY_CHUNK: usize = 500;

/// `SQLite` record store behind a bounded connection pool.
///
/// # Concurrency Model
///
/// Each connection runs in WAL mode with `synchronous = NORMAL` and a busy
/// timeout, so concurrent readers proceed while one writer holds the
/// reserved lock. Pool checkout is the only blocking point and fails with
/// [`Error::PoolExhausted`] after the configured timeout.
///
/// # Schema
///
/// One `memories` table (see [`crate::storage::migrations`]) with an index on
/// `(session_id, id)`. Embeddings are stored as little-endian `f32` blobs,
/// timestamps as Unix milliseconds.
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    pool: ConnectionPool,
    codec: VectorCodec,
}

impl SqliteRecordStore {
    /// Opens (or creates) the store at `path` and applies pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or database cannot be created, or a
    /// migration fails.
    pub fn open(path: impl Into<PathBuf>, dimensions: usize, pool: PoolConfig) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::op("create_data_dir", format!("{}: {e}", parent.display()))
            })?;
        }

        let store = Self {
            pool: ConnectionPool::new(path, pool),
            codec: VectorCodec::new(dimensions),
        };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        let mut conn = self.pool.get()?;
        let applied = MigrationRunner::new(MEMORY_MIGRATIONS).run(&mut conn)?;
        tracing::debug!(
            path = %self.pool.path().display(),
            applied,
            "Record store ready"
        );
        Ok(())
    }

    /// Database file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.pool.path()
    }

    /// The connection pool.
    #[must_use]
    pub const fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Applied schema version.
    ///
    /// # Errors
    ///
    /// Returns an error on pool exhaustion or storage failure.
    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.pool.get()?;
        current_version(&conn)
    }
}

/// Runs `body` inside `BEGIN IMMEDIATE`, committing on success and rolling
/// back on any error.
fn in_transaction<T>(conn: &Connection, body: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| Error::op("begin_transaction", e))?;

    match body(conn) {
        Ok(value) => {
            if let Err(e) = conn.execute_batch("COMMIT") {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(Error::op("commit_transaction", e));
            }
            Ok(value)
        },
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        },
    }
}

fn to_usize(n: i64) -> usize {
    usize::try_from(n).unwrap_or(0)
}

impl RecordStore for SqliteRecordStore {
    fn dimensions(&self) -> usize {
        self.codec.dimensions()
    }

    #[instrument(skip(self, memory), fields(operation = "create", backend = BACKEND, session_id = %memory.session_id))]
    fn create(&self, memory: &NewMemory) -> Result<RecordId> {
        let start = Instant::now();
        let result = (|| {
            let embedding = self.codec.prepare(&memory.embedding)?;
            let blob = crate::embedding::encode(&embedding);
            let conn = self.pool.get()?;

            in_transaction(&conn, |conn| {
                conn.execute(
                    "INSERT INTO memories (session_id, prompt_text, answer_text, summary_text, embedding, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        memory.session_id.as_str(),
                        memory.prompt_text,
                        memory.answer_text,
                        memory.summary_text.as_deref(),
                        blob,
                        chrono::Utc::now().timestamp_millis(),
                    ],
                )
                .map_err(|e| Error::op("insert_memory", e))?;
                Ok(RecordId::new(conn.last_insert_rowid()))
            })
        })();

        record_operation_metrics(BACKEND, "create", start, status_of(&result));
        if let Ok(id) = &result {
            tracing::debug!(record_id = %id, "Stored memory record");
        }
        result
    }

    #[instrument(skip(self), fields(operation = "list_by_session", backend = BACKEND, session_id = %session_id))]
    fn list_by_session(
        &self,
        session_id: &SessionId,
        limit: Option<usize>,
    ) -> Result<Vec<MemoryRecord>> {
        let start = Instant::now();
        let result = (|| {
            let conn = self.pool.get()?;
            let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
            let sql = format!(
                "SELECT {RECORD_COLUMNS} FROM memories WHERE session_id = ?1 ORDER BY id ASC LIMIT ?2"
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| Error::op("prepare_list_by_session", e))?;
            let rows = stmt
                .query_map(params![session_id.as_str(), limit], RecordRow::from_row)
                .map_err(|e| Error::op("list_by_session", e))?;

            let mut records = Vec::new();
            for row in rows {
                let row = row.map_err(|e| Error::op("list_by_session_row", e))?;
                records.push(row.into_record()?);
            }
            Ok(records)
        })();

        record_operation_metrics(BACKEND, "list_by_session", start, status_of(&result));
        result
    }

    #[instrument(skip(self, ids), fields(operation = "get_many", backend = BACKEND, count = ids.len()))]
    fn get_many(&self, ids: &[RecordId]) -> Result<Vec<MemoryRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let result = (|| {
            let conn = self.pool.get()?;
            let mut by_id: HashMap<RecordId, MemoryRecord> = HashMap::with_capacity(ids.len());

            for chunk in ids.chunks(GET_MANY_CHUNK) {
                let placeholders: Vec<String> =
                    (1..=chunk.len()).map(|i| format!("?{i}")).collect();
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM memories WHERE id IN ({})",
                    placeholders.join(", ")
                );
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(|e| Error::op("prepare_get_many", e))?;
                let rows = stmt
                    .query_map(
                        params_from_iter(chunk.iter().map(|id| id.get())),
                        RecordRow::from_row,
                    )
                    .map_err(|e| Error::op("get_many", e))?;
                for row in rows {
                    let record = row.map_err(|e| Error::op("get_many_row", e))?.into_record()?;
                    by_id.insert(record.id, record);
                }
            }

            Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
        })();

        record_operation_metrics(BACKEND, "get_many", start, status_of(&result));
        result
    }

    #[instrument(skip(self, query), fields(operation = "scan_similar", backend = BACKEND, top_k = top_k, scoped = session_id.is_some()))]
    fn scan_similar(
        &self,
        query: &[f32],
        session_id: Option<&SessionId>,
        top_k: usize,
    ) -> Result<Vec<ScoredRecord>> {
        let start = Instant::now();
        let result = (|| {
            self.codec.validate(query)?;
            if top_k == 0 {
                return Ok(Vec::new());
            }

            let conn = self.pool.get()?;
            let (sql, scope) = session_id.map_or_else(
                || (format!("SELECT {RECORD_COLUMNS} FROM memories"), None),
                |s| {
                    (
                        format!("SELECT {RECORD_COLUMNS} FROM memories WHERE session_id = ?1"),
                        Some(s.as_str()),
                    )
                },
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| Error::op("prepare_scan_similar", e))?;
            let rows = stmt
                .query_map(params_from_iter(scope), RecordRow::from_row)
                .map_err(|e| Error::op("scan_similar", e))?;

            // Bounded buffer: re-rank and cut whenever it doubles past top_k.
            let window = top_k.saturating_mul(2);
            let mut best: Vec<ScoredRecord> = Vec::with_capacity(window.min(1024));
            let mut skipped = 0usize;
            for row in rows {
                let record = match row.map_err(|e| Error::op("scan_similar_row", e))?.into_record() {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::debug!(error = %e, "Skipping undecodable row");
                        skipped += 1;
                        continue;
                    },
                };
                if record.embedding.len() != self.codec.dimensions() {
                    skipped += 1;
                    continue;
                }
                let score = dot(query, &record.embedding);
                if !score.is_finite() {
                    skipped += 1;
                    continue;
                }
                best.push(ScoredRecord { record, score });
                if best.len() >= window {
                    ScoredRecord::rank(&mut best, top_k);
                }
            }
            ScoredRecord::rank(&mut best, top_k);

            if skipped > 0 {
                tracing::warn!(skipped, "Exact scan skipped records with unusable embeddings");
            }
            Ok(best)
        })();

        record_operation_metrics(BACKEND, "scan_similar", start, status_of(&result));
        result
    }

    #[instrument(skip(self), fields(operation = "all_session_ids", backend = BACKEND))]
    fn all_session_ids(&self) -> Result<BTreeSet<SessionId>> {
        let start = Instant::now();
        let result = (|| {
            let conn = self.pool.get()?;
            let mut stmt = conn
                .prepare("SELECT DISTINCT session_id FROM memories")
                .map_err(|e| Error::op("prepare_all_session_ids", e))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| Error::op("all_session_ids", e))?;

            let mut sessions = BTreeSet::new();
            for row in rows {
                let raw = row.map_err(|e| Error::op("all_session_ids_row", e))?;
                match SessionId::parse(raw) {
                    Ok(session) => {
                        sessions.insert(session);
                    },
                    Err(e) => tracing::warn!(error = %e, "Ignoring malformed stored session id"),
                }
            }
            Ok(sessions)
        })();

        record_operation_metrics(BACKEND, "all_session_ids", start, status_of(&result));
        result
    }

    #[instrument(skip(self), fields(operation = "collection_size", backend = BACKEND, session_id = %session_id))]
    fn collection_size(&self, session_id: &SessionId) -> Result<usize> {
        let start = Instant::now();
        let result = (|| {
            let conn = self.pool.get()?;
            let n: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM memories WHERE session_id = ?1",
                    params![session_id.as_str()],
                    |row| row.get(0),
                )
                .map_err(|e| Error::op("collection_size", e))?;
            Ok(to_usize(n))
        })();

        record_operation_metrics(BACKEND, "collection_size", start, status_of(&result));
        result
    }

    #[instrument(skip(self), fields(operation = "collection_exists", backend = BACKEND, session_id = %session_id))]
    fn collection_exists(&self, session_id: &SessionId) -> Result<bool> {
        let start = Instant::now();
        let result = (|| {
            let conn = self.pool.get()?;
            conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM memories WHERE session_id = ?1)",
                params![session_id.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| Error::op("collection_exists", e))
        })();

        record_operation_metrics(BACKEND, "collection_exists", start, status_of(&result));
        result
    }

    #[instrument(skip(self), fields(operation = "delete_collection", backend = BACKEND, session_id = %session_id))]
    fn delete_collection(&self, session_id: &SessionId) -> Result<Vec<RecordId>> {
        let start = Instant::now();
        let result = (|| {
            let conn = self.pool.get()?;
            in_transaction(&conn, |conn| {
                let mut stmt = conn
                    .prepare("SELECT id FROM memories WHERE session_id = ?1 ORDER BY id ASC")
                    .map_err(|e| Error::op("prepare_delete_collection", e))?;
                let ids = stmt
                    .query_map(params![session_id.as_str()], |row| {
                        row.get::<_, i64>(0).map(RecordId::new)
                    })
                    .map_err(|e| Error::op("select_collection_ids", e))?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(|e| Error::op("select_collection_ids_row", e))?;

                conn.execute(
                    "DELETE FROM memories WHERE session_id = ?1",
                    params![session_id.as_str()],
                )
                .map_err(|e| Error::op("delete_collection", e))?;
                Ok(ids)
            })
        })();

        record_operation_metrics(BACKEND, "delete_collection", start, status_of(&result));
        if let Ok(ids) = &result {
            tracing::info!(removed = ids.len(), "Deleted session records");
        }
        result
    }

    #[instrument(skip(self), fields(operation = "count", backend = BACKEND))]
    fn count(&self) -> Result<usize> {
        let start = Instant::now();
        let result = (|| {
            let conn = self.pool.get()?;
            let n: i64 = conn
                .query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))
                .map_err(|e| Error::op("count", e))?;
            Ok(to_usize(n))
        })();

        record_operation_metrics(BACKEND, "count", start, status_of(&result));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{encode, l2_norm};
    use tempfile::TempDir;
    use test_case::test_case;

    fn store(dir: &TempDir, dim: usize) -> SqliteRecordStore {
        SqliteRecordStore::open(dir.path().join("memories.db"), dim, PoolConfig::default())
            .unwrap()
    }

    fn session(s: &str) -> SessionId {
        SessionId::parse(s).unwrap()
    }

    fn memory(s: &str, embedding: Vec<f32>) -> NewMemory {
        NewMemory::new(session(s), "prompt", "answer", embedding)
    }

    #[test]
    fn test_create_and_list() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 3);

        let id = store.create(&memory("demo", vec![2.0, 0.0, 0.0])).unwrap();
        let records = store.list_by_session(&session("demo"), None).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].embedding, vec![1.0, 0.0, 0.0]);
        assert_eq!(records[0].prompt_text, "prompt");
        assert!(records[0].summary_text.is_none());
    }

    #[test_case(1 ; "dim 1")]
    #[test_case(3 ; "dim 3")]
    #[test_case(768 ; "dim 768")]
    fn test_create_rejects_wrong_dimension(dim: usize) {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, dim);

        let err = store.create(&memory("s", vec![1.0; dim + 1])).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected, actual } if expected == dim && actual == dim + 1));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_create_rejects_non_finite() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 2);
        let err = store.create(&memory("s", vec![f32::NAN, 1.0])).unwrap_err();
        assert!(matches!(err, Error::InvalidVector(_)));
    }

    #[test]
    fn test_create_normalizes_and_nudges_zero() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 4);
        store.create(&memory("s", vec![0.0; 4])).unwrap();

        let record = &store.list_by_session(&session("s"), None).unwrap()[0];
        assert!((l2_norm(&record.embedding) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_list_is_insertion_ordered_and_limited() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 2);
        let ids: Vec<_> = (0..5)
            .map(|_| store.create(&memory("s", vec![1.0, 0.0])).unwrap())
            .collect();
        store.create(&memory("other", vec![1.0, 0.0])).unwrap();

        let all = store.list_by_session(&session("s"), None).unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), ids);

        let limited = store.list_by_session(&session("s"), Some(2)).unwrap();
        assert_eq!(limited.iter().map(|r| r.id).collect::<Vec<_>>(), ids[..2]);

        assert!(store.list_by_session(&session("nobody"), None).unwrap().is_empty());
    }

    #[test]
    fn test_get_many_preserves_request_order() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 2);
        let a = store.create(&memory("s", vec![1.0, 0.0])).unwrap();
        let b = store.create(&memory("s", vec![0.0, 1.0])).unwrap();

        let records = store.get_many(&[b, RecordId::new(999), a]).unwrap();
        assert_eq!(records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![b, a]);
        assert!(store.get_many(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_scan_similar_ranks_and_scopes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 2);
        let a = store.create(&memory("s", vec![1.0, 0.0])).unwrap();
        let b = store.create(&memory("s", vec![0.9, 0.1])).unwrap();
        store.create(&memory("s", vec![0.0, 1.0])).unwrap();
        let other = store.create(&memory("t", vec![1.0, 0.0])).unwrap();

        let scoped = store
            .scan_similar(&[1.0, 0.0], Some(&session("s")), 2)
            .unwrap();
        assert_eq!(
            scoped.iter().map(|r| r.record.id).collect::<Vec<_>>(),
            vec![a, b]
        );
        assert!(scoped[0].score >= scoped[1].score);

        let global = store.scan_similar(&[1.0, 0.0], None, 2).unwrap();
        // Equal scores: most recent first.
        assert_eq!(
            global.iter().map(|r| r.record.id).collect::<Vec<_>>(),
            vec![other, a]
        );
    }

    #[test]
    fn test_scan_similar_large_corpus_keeps_best() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 2);
        for i in 0..50u8 {
            let x = f32::from(i) / 50.0;
            store.create(&memory("s", vec![x, 1.0 - x])).unwrap();
        }
        let top = store.scan_similar(&[1.0, 0.0], None, 3).unwrap();
        assert_eq!(top.len(), 3);
        assert!(top.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_scan_similar_skips_corrupt_rows() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 2);
        let good = store.create(&memory("s", vec![1.0, 0.0])).unwrap();
        {
            let conn = store.pool().get().unwrap();
            conn.execute(
                "INSERT INTO memories (session_id, prompt_text, answer_text, embedding, created_at)
                 VALUES ('s', 'p', 'a', ?1, 0)",
                params![encode(&[1.0, 0.0, 0.0])],
            )
            .unwrap();
        }
        let hits = store.scan_similar(&[1.0, 0.0], None, 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, good);
    }

    #[test]
    fn test_scan_similar_ignores_non_finite_and_malformed_rows() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 2);
        let good = store.create(&memory("s", vec![1.0, 0.0])).unwrap();
        {
            let conn = store.pool().get().unwrap();
            for (session, embedding) in [
                ("s", encode(&[f32::NAN, f32::NAN])),
                ("s", encode(&[f32::INFINITY, 0.0])),
                ("bad id", encode(&[1.0, 0.0])),
            ] {
                conn.execute(
                    "INSERT INTO memories (session_id, prompt_text, answer_text, embedding, created_at)
                     VALUES (?1, 'p', 'a', ?2, 0)",
                    params![session, embedding],
                )
                .unwrap();
            }
        }

        let hits = store.scan_similar(&[1.0, 0.0], None, 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, good);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_scan_similar_rejects_wrong_query_dimension() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 2);
        assert!(matches!(
            store.scan_similar(&[1.0], None, 1),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_session_operations() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 2);
        let demo = session("demo");
        store.create(&memory("demo", vec![1.0, 0.0])).unwrap();
        store.create(&memory("demo", vec![0.0, 1.0])).unwrap();
        store.create(&memory("keep", vec![0.0, 1.0])).unwrap();

        assert!(store.collection_exists(&demo).unwrap());
        assert_eq!(store.collection_size(&demo).unwrap(), 2);
        assert_eq!(
            store.all_session_ids().unwrap(),
            BTreeSet::from([demo.clone(), session("keep")])
        );

        let removed = store.delete_collection(&demo).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!store.collection_exists(&demo).unwrap());
        assert_eq!(store.collection_size(&demo).unwrap(), 0);
        assert_eq!(store.count().unwrap(), 1);
        assert!(store.delete_collection(&demo).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = TempDir::new().unwrap();
        store(&dir, 2).create(&memory("s", vec![1.0, 0.0])).unwrap();

        let reopened = store(&dir, 2);
        assert_eq!(reopened.count().unwrap(), 1);
        assert_eq!(reopened.schema_version().unwrap(), 2);
    }
}
