//! usearch HNSW backend.
//!
//! Wraps the native usearch library behind [`AnnIndex`]. Record ids are used
//! directly as usearch keys. The snapshot is usearch's own file at the
//! snapshot path plus a `.meta.json` sidecar holding the [`SnapshotHeader`],
//! whose checksum covers the native file.

use super::snapshot::{SnapshotHeader, unavailable, write_atomic};
use crate::models::RecordId;
use crate::storage::traits::{AnnIndex, AnnParams};
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

const BACKEND: &str = "usearch";

/// Native usearch index sized for `max_elements`.
pub struct UsearchIndex {
    params: AnnParams,
    index: Index,
}

impl UsearchIndex {
    /// Creates an empty index with capacity reserved.
    ///
    /// # Errors
    ///
    /// Returns an error if the native index cannot be created.
    pub fn new(params: AnnParams) -> Result<Self> {
        Ok(Self {
            params,
            index: create_index(&params)?,
        })
    }
}

fn create_index(params: &AnnParams) -> Result<Index> {
    let options = IndexOptions {
        dimensions: params.dimensions,
        metric: MetricKind::Cos,
        quantization: ScalarKind::F32,
        connectivity: params.m,
        expansion_add: params.ef_construction,
        expansion_search: params.ef,
        multi: false,
    };
    let index = Index::new(&options).map_err(|e| Error::op("create_usearch_index", e))?;
    index
        .reserve(params.max_elements)
        .map_err(|e| Error::op("reserve_usearch_capacity", e))?;
    Ok(index)
}

fn meta_path(path: &Path) -> PathBuf {
    path.with_extension("meta.json")
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

const fn key_of(id: RecordId) -> u64 {
    id.as_key()
}

impl AnnIndex for UsearchIndex {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn params(&self) -> &AnnParams {
        &self.params
    }

    fn count(&self) -> usize {
        self.index.size()
    }

    fn contains(&self, id: RecordId) -> bool {
        self.index.contains(key_of(id))
    }

    fn insert(&mut self, vector: &[f32], id: RecordId) -> Result<()> {
        if vector.len() != self.params.dimensions {
            return Err(Error::DimensionMismatch {
                expected: self.params.dimensions,
                actual: vector.len(),
            });
        }
        if self.contains(id) {
            tracing::debug!(record_id = %id, "Vector already indexed");
            return Ok(());
        }
        if self.index.size() >= self.params.max_elements {
            return Err(Error::IndexFull {
                capacity: self.params.max_elements,
            });
        }
        self.index
            .add(key_of(id), vector)
            .map_err(|e| Error::op("usearch_add", e))
    }

    fn query(&self, vector: &[f32], k: usize) -> Result<Vec<(RecordId, f32)>> {
        if vector.len() != self.params.dimensions {
            return Err(Error::DimensionMismatch {
                expected: self.params.dimensions,
                actual: vector.len(),
            });
        }
        if k == 0 || self.index.size() == 0 {
            return Ok(Vec::new());
        }

        let matches = self
            .index
            .search(vector, k.min(self.index.size()))
            .map_err(|e| unavailable(format!("usearch search: {e}")))?;

        // Cosine distance is 1 - similarity.
        Ok(matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .map(|(&key, &distance)| (RecordId::from_key(key), 1.0 - distance))
            .collect())
    }

    fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::op("create_snapshot_dir", e))?;
        }
        // Save beside the live snapshot, then rename over it.
        let tmp = tmp_path(path);
        self.index
            .save(tmp.to_string_lossy().as_ref())
            .map_err(|e| Error::op("save_usearch_index", e))?;
        let body = std::fs::read(&tmp).map_err(|e| Error::op("read_usearch_index", e))?;
        std::fs::rename(&tmp, path).map_err(|e| Error::op("rename_usearch_index", e))?;

        let header = SnapshotHeader::new(BACKEND, self.params, self.index.size(), &body);
        let meta =
            serde_json::to_vec_pretty(&header).map_err(|e| Error::op("serialize_usearch_meta", e))?;
        write_atomic(&meta_path(path), &meta)?;

        tracing::info!(path = %path.display(), count = header.count, "Persisted usearch snapshot");
        Ok(())
    }

    fn restore(&mut self, path: &Path) -> Result<()> {
        let meta_file = meta_path(path);
        let meta = std::fs::read(&meta_file)
            .map_err(|e| unavailable(format!("read {}: {e}", meta_file.display())))?;
        let header: SnapshotHeader = serde_json::from_slice(&meta)
            .map_err(|e| unavailable(format!("usearch meta: {e}")))?;
        header.check_compatible(BACKEND, &self.params)?;

        let body = std::fs::read(path)
            .map_err(|e| unavailable(format!("read {}: {e}", path.display())))?;
        header.verify(&body)?;

        let index = create_index(&self.params)
            .map_err(|e| unavailable(format!("usearch create: {e}")))?;
        index
            .load(path.to_string_lossy().as_ref())
            .map_err(|e| unavailable(format!("usearch load: {e}")))?;
        if index.size() != header.count {
            return Err(unavailable(format!(
                "usearch snapshot holds {} vectors, header says {}",
                index.size(),
                header.count
            )));
        }
        index
            .reserve(self.params.max_elements)
            .map_err(|e| unavailable(format!("usearch reserve: {e}")))?;

        self.index = index;
        tracing::info!(path = %path.display(), count = header.count, "Restored usearch snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn params() -> AnnParams {
        AnnParams {
            dimensions: 3,
            max_elements: 8,
            m: 8,
            ef_construction: 32,
            ef: 16,
        }
    }

    #[test]
    fn test_insert_query() {
        let mut index = UsearchIndex::new(params()).unwrap();
        index.insert(&[1.0, 0.0, 0.0], RecordId::new(1)).unwrap();
        index.insert(&[0.0, 1.0, 0.0], RecordId::new(2)).unwrap();

        let hits = index.query(&[1.0, 0.0, 0.0], 5).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, RecordId::new(1));
        assert!((hits[0].1 - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_capacity() {
        let mut index = UsearchIndex::new(AnnParams {
            max_elements: 1,
            ..params()
        })
        .unwrap();
        index.insert(&[1.0, 0.0, 0.0], RecordId::new(1)).unwrap();
        assert!(matches!(
            index.insert(&[0.0, 1.0, 0.0], RecordId::new(2)),
            Err(Error::IndexFull { capacity: 1 })
        ));
    }

    #[test]
    fn test_persist_restore_and_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.snapshot");
        let mut index = UsearchIndex::new(params()).unwrap();
        index.insert(&[1.0, 0.0, 0.0], RecordId::new(7)).unwrap();
        index.persist(&path).unwrap();

        let mut restored = UsearchIndex::new(params()).unwrap();
        restored.restore(&path).unwrap();
        assert_eq!(restored.count(), 1);
        assert!(restored.contains(RecordId::new(7)));

        std::fs::write(&path, b"garbage").unwrap();
        let mut broken = UsearchIndex::new(params()).unwrap();
        assert!(matches!(
            broken.restore(&path),
            Err(Error::IndexUnavailable(_))
        ));
    }

    #[test]
    fn test_interrupted_save_leaves_snapshot_intact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.snapshot");
        let mut index = UsearchIndex::new(params()).unwrap();
        index.insert(&[1.0, 0.0, 0.0], RecordId::new(7)).unwrap();
        index.persist(&path).unwrap();
        assert!(!tmp_path(&path).exists());

        // A save that died halfway leaves only its temp file behind.
        std::fs::write(tmp_path(&path), b"partial").unwrap();
        let mut restored = UsearchIndex::new(params()).unwrap();
        restored.restore(&path).unwrap();
        assert!(restored.contains(RecordId::new(7)));

        index.insert(&[0.0, 1.0, 0.0], RecordId::new(8)).unwrap();
        index.persist(&path).unwrap();
        let mut again = UsearchIndex::new(params()).unwrap();
        again.restore(&path).unwrap();
        assert_eq!(again.count(), 2);
    }
}
