//! HNSW index backed by `hnsw_rs`.
//!
//! Vectors are inserted under a dense data id (their position in `ids`),
//! which maps back to the [`RecordId`]. Distances are cosine distances, so a
//! hit's score is `1 - distance`.
//!
//! # Snapshot layout
//!
//! `hnsw_rs` dumps the graph and the point data beside the snapshot path as
//! `<name>.hnsw.graph` and `<name>.hnsw.data`. The snapshot path itself holds
//! a JSON sidecar with the [`SnapshotHeader`], whose checksum covers both
//! dump files, and the record ids in data-id order. The dump is written
//! under a temporary name and renamed before the sidecar is replaced.

use super::snapshot::{SnapshotHeader, unavailable, write_atomic};
use crate::models::RecordId;
use crate::storage::traits::{AnnIndex, AnnParams};
use crate::{Error, Result};
use anndists::dist::distances::DistCosine;
use hnsw_rs::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const BACKEND: &str = "hnsw";

/// Layer cap accepted by `hnsw_rs`.
const MAX_LAYERS: usize = 16;

type Graph = Hnsw<'static, f32, DistCosine>;

/// In-memory HNSW graph keyed by [`RecordId`].
pub struct HnswIndex {
    params: AnnParams,
    graph: Graph,
    ids: Vec<RecordId>,
    positions: HashMap<RecordId, usize>,
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("params", &self.params)
            .field("count", &self.ids.len())
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotMeta {
    header: SnapshotHeader,
    ids: Vec<RecordId>,
}

fn new_graph(params: &AnnParams) -> Graph {
    Hnsw::new(
        params.m,
        params.max_elements,
        MAX_LAYERS,
        params.ef_construction,
        DistCosine {},
    )
}

/// Base name for the dump files: the snapshot file name plus `suffix`.
fn dump_name(path: &Path, suffix: &str) -> Result<String> {
    let name = path.file_name().ok_or_else(|| {
        Error::op("snapshot_path", format!("{} has no file name", path.display()))
    })?;
    Ok(format!("{}{suffix}", name.to_string_lossy()))
}

fn dump_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

fn dump_files(dir: &Path, basename: &str) -> [PathBuf; 2] {
    [
        dir.join(format!("{basename}.hnsw.graph")),
        dir.join(format!("{basename}.hnsw.data")),
    ]
}

impl HnswIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new(params: AnnParams) -> Self {
        Self {
            graph: new_graph(&params),
            params,
            ids: Vec::new(),
            positions: HashMap::new(),
        }
    }

    fn check_vector(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.params.dimensions {
            return Err(Error::DimensionMismatch {
                expected: self.params.dimensions,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(Error::InvalidVector("ANN vectors must be finite".to_string()));
        }
        Ok(())
    }

    /// Dumps the graph under a temporary name, then renames it into place.
    /// Returns the dump files' bytes, graph first.
    fn dump_graph(&self, path: &Path) -> Result<Vec<u8>> {
        let dir = dump_dir(path);
        std::fs::create_dir_all(&dir).map_err(|e| Error::op("create_snapshot_dir", e))?;

        let written = self
            .graph
            .file_dump(&dir, &dump_name(path, ".tmp")?)
            .map_err(|e| Error::op("dump_hnsw_graph", e))?;
        let tmp_files = dump_files(&dir, &written);
        let final_files = dump_files(&dir, &dump_name(path, "")?);

        let mut body = Vec::new();
        for (tmp, target) in tmp_files.iter().zip(&final_files) {
            body.extend(std::fs::read(tmp).map_err(|e| Error::op("read_hnsw_dump", e))?);
            std::fs::rename(tmp, target).map_err(|e| Error::op("rename_hnsw_dump", e))?;
        }
        Ok(body)
    }

    fn load_graph(&self, path: &Path, header: &SnapshotHeader) -> Result<Graph> {
        if header.count == 0 {
            header.verify(&[])?;
            return Ok(new_graph(&self.params));
        }

        let dir = dump_dir(path);
        let basename = dump_name(path, "").map_err(|e| unavailable(e.to_string()))?;
        let mut body = Vec::new();
        for file in dump_files(&dir, &basename) {
            body.extend(
                std::fs::read(&file)
                    .map_err(|e| unavailable(format!("read {}: {e}", file.display())))?,
            );
        }
        header.verify(&body)?;

        // The loaded graph borrows its loader, which therefore has to outlive
        // the index. Without mmap the loader holds only paths and options.
        let loader: &'static mut HnswIo = Box::leak(Box::new(HnswIo::new(&dir, &basename)));
        let graph: Graph = loader
            .load_hnsw::<f32, DistCosine>()
            .map_err(|e| unavailable(format!("load hnsw dump: {e}")))?;
        if graph.get_nb_point() != header.count {
            return Err(unavailable(format!(
                "hnsw dump holds {} points, header says {}",
                graph.get_nb_point(),
                header.count
            )));
        }
        Ok(graph)
    }
}

impl AnnIndex for HnswIndex {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn params(&self) -> &AnnParams {
        &self.params
    }

    fn count(&self) -> usize {
        self.ids.len()
    }

    fn contains(&self, id: RecordId) -> bool {
        self.positions.contains_key(&id)
    }

    fn insert(&mut self, vector: &[f32], id: RecordId) -> Result<()> {
        self.check_vector(vector)?;
        if self.positions.contains_key(&id) {
            tracing::debug!(record_id = %id, "Vector already indexed");
            return Ok(());
        }
        if self.ids.len() >= self.params.max_elements {
            return Err(Error::IndexFull {
                capacity: self.params.max_elements,
            });
        }

        let data_id = self.ids.len();
        let data = vector.to_vec();
        self.graph.insert((&data, data_id));
        self.ids.push(id);
        self.positions.insert(id, data_id);
        Ok(())
    }

    fn query(&self, vector: &[f32], k: usize) -> Result<Vec<(RecordId, f32)>> {
        self.check_vector(vector)?;
        if k == 0 || self.ids.is_empty() {
            return Ok(Vec::new());
        }

        let k = k.min(self.ids.len());
        let neighbours = self.graph.search(vector, k, self.params.ef.max(k));
        let mut hits = Vec::with_capacity(neighbours.len());
        for neighbour in neighbours {
            let Some(&id) = self.ids.get(neighbour.d_id) else {
                return Err(unavailable(format!(
                    "hnsw returned unknown data id {}",
                    neighbour.d_id
                )));
            };
            hits.push((id, 1.0 - neighbour.distance));
        }
        Ok(hits)
    }

    fn persist(&self, path: &Path) -> Result<()> {
        let body = if self.ids.is_empty() {
            Vec::new()
        } else {
            self.dump_graph(path)?
        };
        let meta = SnapshotMeta {
            header: SnapshotHeader::new(BACKEND, self.params, self.ids.len(), &body),
            ids: self.ids.clone(),
        };
        let bytes = serde_json::to_vec(&meta).map_err(|e| Error::op("serialize_hnsw_meta", e))?;
        write_atomic(path, &bytes)?;

        tracing::info!(path = %path.display(), count = self.ids.len(), "Persisted HNSW snapshot");
        Ok(())
    }

    fn restore(&mut self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)
            .map_err(|e| unavailable(format!("read {}: {e}", path.display())))?;
        let meta: SnapshotMeta = serde_json::from_slice(&bytes)
            .map_err(|e| unavailable(format!("snapshot meta: {e}")))?;
        meta.header.check_compatible(BACKEND, &self.params)?;
        if meta.ids.len() != meta.header.count {
            return Err(unavailable(format!(
                "snapshot lists {} ids, header says {}",
                meta.ids.len(),
                meta.header.count
            )));
        }

        let mut positions = HashMap::with_capacity(meta.ids.len());
        for (data_id, &id) in meta.ids.iter().enumerate() {
            if positions.insert(id, data_id).is_some() {
                return Err(unavailable(format!("duplicate record {id} in snapshot")));
            }
        }
        let graph = self.load_graph(path, &meta.header)?;

        self.graph = graph;
        self.ids = meta.ids;
        self.positions = positions;
        tracing::info!(path = %path.display(), count = self.ids.len(), "Restored HNSW snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{dot, normalize};
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn params(dimensions: usize, max_elements: usize) -> AnnParams {
        AnnParams {
            dimensions,
            max_elements,
            m: 16,
            ef_construction: 100,
            ef: 64,
        }
    }

    /// Deterministic pseudo-random unit vectors.
    #[allow(clippy::cast_precision_loss)]
    fn vectors(count: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut state = seed;
        (0..count)
            .map(|_| {
                let raw: Vec<f32> = (0..dim)
                    .map(|_| {
                        state = state
                            .wrapping_mul(6_364_136_223_846_793_005)
                            .wrapping_add(1_442_695_040_888_963_407);
                        ((state >> 33) as f32 / (1u64 << 31) as f32) - 0.5
                    })
                    .collect();
                normalize(&raw)
            })
            .collect()
    }

    #[allow(clippy::cast_possible_wrap)]
    fn build(count: usize, dim: usize) -> (HnswIndex, Vec<Vec<f32>>) {
        let data = vectors(count, dim, 42);
        let mut index = HnswIndex::new(params(dim, count + 10));
        for (i, v) in data.iter().enumerate() {
            index.insert(v, RecordId::new(i as i64 + 1)).unwrap();
        }
        (index, data)
    }

    #[test]
    fn test_empty_index() {
        let index = HnswIndex::new(params(3, 10));
        assert_eq!(index.count(), 0);
        assert!(index.query(&[1.0, 0.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_fewer_than_k_returns_all_ranked() {
        let mut index = HnswIndex::new(params(2, 10));
        index.insert(&[1.0, 0.0], RecordId::new(1)).unwrap();
        index.insert(&normalize(&[1.0, 1.0]), RecordId::new(2)).unwrap();
        index.insert(&[0.0, 1.0], RecordId::new(3)).unwrap();

        let hits = index.query(&[1.0, 0.0], 10).unwrap();
        let ids: Vec<i64> = hits.iter().map(|(id, _)| id.get()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!((hits[0].1 - 1.0).abs() < 1e-5);
    }

    #[test]
    #[allow(clippy::cast_possible_wrap)]
    fn test_exact_match_is_top_hit() {
        let (index, data) = build(500, 16);
        for target in [0usize, 123, 499] {
            let hits = index.query(&data[target], 5).unwrap();
            assert_eq!(hits[0].0, RecordId::new(target as i64 + 1));
        }
    }

    #[test]
    #[allow(clippy::cast_possible_wrap)]
    fn test_recall_against_brute_force() {
        let (index, data) = build(800, 12);
        let mut overlap = 0;
        for q in &vectors(20, 12, 7) {
            let approx: HashSet<RecordId> =
                index.query(q, 10).unwrap().into_iter().map(|h| h.0).collect();
            let mut exact: Vec<(usize, f32)> =
                data.iter().enumerate().map(|(i, v)| (i, dot(q, v))).collect();
            exact.sort_by(|a, b| b.1.total_cmp(&a.1));
            overlap += exact
                .iter()
                .take(10)
                .filter(|(i, _)| approx.contains(&RecordId::new(*i as i64 + 1)))
                .count();
        }
        // 200 true neighbors in total.
        assert!(overlap >= 170, "recall too low: {overlap}/200");
    }

    #[test]
    fn test_capacity_dimension_and_finiteness_errors() {
        let mut index = HnswIndex::new(params(2, 1));
        index.insert(&[1.0, 0.0], RecordId::new(1)).unwrap();
        assert!(matches!(
            index.insert(&[0.0, 1.0], RecordId::new(2)),
            Err(Error::IndexFull { capacity: 1 })
        ));
        assert!(matches!(
            index.query(&[1.0], 1),
            Err(Error::DimensionMismatch { .. })
        ));
        assert!(matches!(
            index.query(&[f32::NAN, 0.0], 1),
            Err(Error::InvalidVector(_))
        ));
    }

    #[test]
    fn test_duplicate_insert_is_ignored() {
        let mut index = HnswIndex::new(params(2, 4));
        index.insert(&[1.0, 0.0], RecordId::new(1)).unwrap();
        index.insert(&[0.0, 1.0], RecordId::new(1)).unwrap();
        assert_eq!(index.count(), 1);
    }

    #[test]
    fn test_delete_is_unsupported() {
        let mut index = HnswIndex::new(params(2, 4));
        index.insert(&[1.0, 0.0], RecordId::new(1)).unwrap();
        assert!(!index.delete(RecordId::new(1)).unwrap());
        assert_eq!(index.count(), 1);
    }

    #[test]
    fn test_insert_many_length_mismatch() {
        let mut index = HnswIndex::new(params(2, 4));
        let result = index.insert_many(&[vec![1.0, 0.0]], &[]);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_persist_and_restore() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.snapshot");
        let (index, data) = build(200, 8);
        index.persist(&path).unwrap();
        assert!(dir.path().join("index.snapshot.hnsw.graph").exists());
        assert!(dir.path().join("index.snapshot.hnsw.data").exists());

        let mut restored = HnswIndex::new(*index.params());
        restored.restore(&path).unwrap();
        assert_eq!(restored.count(), 200);
        assert!(restored.contains(RecordId::new(18)));
        assert_eq!(restored.query(&data[17], 1).unwrap()[0].0, RecordId::new(18));
    }

    #[test]
    fn test_persist_and_restore_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.snapshot");
        HnswIndex::new(params(4, 10)).persist(&path).unwrap();

        let mut restored = HnswIndex::new(params(4, 10));
        restored.restore(&path).unwrap();
        assert_eq!(restored.count(), 0);
    }

    #[test]
    fn test_restore_rejects_tampered_dump() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.snapshot");
        let (index, _) = build(50, 4);
        index.persist(&path).unwrap();

        let data_file = dir.path().join("index.snapshot.hnsw.data");
        let bytes = std::fs::read(&data_file).unwrap();
        std::fs::write(&data_file, &bytes[..bytes.len() / 2]).unwrap();

        let mut target = HnswIndex::new(*index.params());
        target.insert(&[1.0, 0.0, 0.0, 0.0], RecordId::new(999)).unwrap();
        assert!(matches!(
            target.restore(&path),
            Err(Error::IndexUnavailable(_))
        ));
        // Unchanged on failure.
        assert_eq!(target.count(), 1);
        assert!(target.contains(RecordId::new(999)));
    }

    #[test]
    fn test_restore_rejects_truncated_meta() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.snapshot");
        let (index, _) = build(20, 4);
        index.persist(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        let mut target = HnswIndex::new(*index.params());
        assert!(matches!(
            target.restore(&path),
            Err(Error::IndexUnavailable(_))
        ));
    }

    #[test]
    fn test_restore_rejects_other_configuration() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.snapshot");
        let (index, _) = build(10, 4);
        index.persist(&path).unwrap();

        let mut bigger = HnswIndex::new(params(4, 1_000));
        assert!(bigger.restore(&path).is_err());
        let mut missing = HnswIndex::new(*index.params());
        assert!(missing.restore(&dir.path().join("absent")).is_err());
    }
}
