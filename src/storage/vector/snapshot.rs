//! Snapshot header shared by the index backends.
//!
//! A snapshot may only be restored by the backend that wrote it, with the
//! same dimension, capacity and graph parameters. Any mismatch or checksum
//! failure is reported as [`Error::IndexUnavailable`] so the caller falls
//! back to a full backfill.

use crate::storage::traits::AnnParams;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

/// Bumped whenever the on-disk layout changes.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Metadata written ahead of (or beside) the index body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    /// Layout version.
    pub format_version: u32,
    /// Backend that wrote the snapshot.
    pub backend: String,
    /// Construction parameters at write time.
    pub params: AnnParams,
    /// Number of vectors in the body.
    pub count: usize,
    /// Hex SHA-256 of the body.
    pub checksum: String,
}

impl SnapshotHeader {
    /// Builds a header for `body`.
    #[must_use]
    pub fn new(backend: &str, params: AnnParams, count: usize, body: &[u8]) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            backend: backend.to_string(),
            params,
            count,
            checksum: checksum(body),
        }
    }

    /// Checks that this snapshot can be loaded by `backend` running with
    /// `params`. The query-time `ef` may differ.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexUnavailable`] describing the first mismatch.
    pub fn check_compatible(&self, backend: &str, params: &AnnParams) -> Result<()> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(unavailable(format!(
                "snapshot format {} (expected {SNAPSHOT_FORMAT_VERSION})",
                self.format_version
            )));
        }
        if self.backend != backend {
            return Err(unavailable(format!(
                "snapshot written by {} (expected {backend})",
                self.backend
            )));
        }
        let written = &self.params;
        if written.dimensions != params.dimensions
            || written.max_elements != params.max_elements
            || written.m != params.m
            || written.ef_construction != params.ef_construction
        {
            return Err(unavailable(format!(
                "snapshot parameters {written:?} do not match {params:?}"
            )));
        }
        if self.count > params.max_elements {
            return Err(unavailable(format!(
                "snapshot holds {} vectors, capacity is {}",
                self.count, params.max_elements
            )));
        }
        Ok(())
    }

    /// Checks `body` against the recorded checksum.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexUnavailable`] on mismatch.
    pub fn verify(&self, body: &[u8]) -> Result<()> {
        if checksum(body) == self.checksum {
            Ok(())
        } else {
            Err(unavailable("snapshot checksum mismatch"))
        }
    }
}

/// Hex-encoded SHA-256 of `bytes`.
#[must_use]
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Shorthand for [`Error::IndexUnavailable`].
pub fn unavailable(reason: impl Into<String>) -> Error {
    Error::IndexUnavailable(reason.into())
}

/// Writes `bytes` to a sibling temp file, then renames it over `path`.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] on I/O failure.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| Error::op("create_snapshot_dir", e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, bytes).map_err(|e| Error::op("write_snapshot", e))?;
    fs::rename(&tmp, path).map_err(|e| Error::op("rename_snapshot", e))
}
