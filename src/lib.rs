//! # Memvault
//!
//! Embedding storage and retrieval engine for conversational AI memory.
//!
//! Memvault persists every prompt/response exchange as text plus a
//! unit-normalized embedding, and later retrieves the semantically closest
//! prior exchanges to ground a new generation request.
//!
//! ## Architecture
//!
//! - **Vector codec**: normalization, sanitization and little-endian `f32` encoding
//! - **Record store**: `SQLite` (WAL) behind a bounded connection pool, the source of truth
//! - **ANN index**: in-memory HNSW (pure Rust, or usearch with `usearch-hnsw`)
//! - **Bootstrapper**: snapshot restore with full backfill fallback
//! - **Retrieval coordinator**: cache, then ANN, then exact scan
//!
//! ## Example
//!
//! ```rust,ignore
//! use memvault::{MemoryService, MemvaultConfig, NewMemory, SessionId};
//!
//! let service = MemoryService::open(MemvaultConfig::load_default())?;
//! let session = SessionId::parse("demo")?;
//! let id = service.create_memory(NewMemory::new(session.clone(), "hi", "hello", embedding))?;
//! let hits = service.find_similar(&query, Some(&session), 5)?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

pub mod config;
pub mod embedding;
pub mod models;
pub mod observability;
pub mod services;
pub mod storage;

pub use config::MemvaultConfig;
pub use embedding::VectorCodec;
pub use models::{MemoryRecord, NewMemory, RecordId, ScoredRecord, SessionId};
pub use services::{
    IndexBootstrapper, MemoryService, RetrievalCoordinator, Retriever, SimilarityCache,
};
pub use storage::{AnnIndex, RecordStore, SharedIndex, SqliteRecordStore};

/// Error type for memvault operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidVector` | Empty vectors, vectors the codec cannot rescue |
/// | `DimensionMismatch` | Embedding length differs from the configured dimension |
/// | `InvalidInput` | Malformed session id, oversized text, `top_k == 0` |
/// | `PoolExhausted` | Pool and overflow busy for longer than the acquire timeout |
/// | `IndexFull` | ANN index reached `max_elements` |
/// | `IndexUnavailable` | ANN query or snapshot restore failed (recovered internally) |
/// | `OperationFailed` | `SQLite`, filesystem or serialization failures |
#[derive(Debug, ThisError)]
pub enum Error {
    /// The vector cannot be used.
    ///
    /// Raised when:
    /// - The vector is empty
    /// - Sanitization cannot resolve a usable length
    /// - A stored embedding blob is not a whole number of `f32`s
    #[error("invalid vector: {0}")]
    InvalidVector(String),

    /// The embedding length does not equal the deployment dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Configured embedding dimension.
        expected: usize,
        /// Length of the offending vector.
        actual: usize,
    },

    /// Invalid input was provided.
    ///
    /// Raised when:
    /// - A session id contains characters outside `[A-Za-z0-9_-]` or is too long
    /// - Prompt, answer or summary text exceeds the configured bound
    /// - `top_k` is zero
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No pooled connection became available in time.
    ///
    /// Retryable: the caller may back off and try again.
    #[error("connection pool exhausted after {waited_ms}ms (capacity {capacity})")]
    PoolExhausted {
        /// How long the caller waited.
        waited_ms: u64,
        /// Pool size plus overflow.
        capacity: usize,
    },

    /// The ANN index cannot accept more vectors.
    ///
    /// Operationally fatal until capacity is raised and the index rebuilt.
    #[error("ANN index full (capacity {capacity})")]
    IndexFull {
        /// Configured `max_elements`.
        capacity: usize,
    },

    /// The ANN index could not serve a request.
    ///
    /// Never surfaced by [`MemoryService`]; the coordinator falls back to an
    /// exact scan and the bootstrapper to a full backfill.
    #[error("ANN index unavailable: {0}")]
    IndexUnavailable(String),

    /// An operation failed.
    ///
    /// Raised when:
    /// - `SQLite` statements or transactions fail
    /// - Filesystem I/O errors occur
    /// - Configuration or snapshot (de)serialization fails
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

impl Error {
    /// Returns true if the caller may retry the same request unchanged.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }

    /// Shorthand for [`Error::OperationFailed`].
    pub(crate) fn op(operation: &str, cause: impl std::fmt::Display) -> Self {
        Self::OperationFailed {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }
}

/// Result type alias for memvault operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::DimensionMismatch {
            expected: 768,
            actual: 3,
        };
        assert_eq!(err.to_string(), "dimension mismatch: expected 768, got 3");

        let err = Error::op("open_sqlite", "disk I/O error");
        assert_eq!(
            err.to_string(),
            "operation 'open_sqlite' failed: disk I/O error"
        );

        let err = Error::PoolExhausted {
            waited_ms: 50,
            capacity: 3,
        };
        assert!(err.to_string().contains("exhausted"));
    }

    #[test]
    fn test_only_pool_exhaustion_is_retryable() {
        assert!(
            Error::PoolExhausted {
                waited_ms: 1,
                capacity: 1
            }
            .is_retryable()
        );
        assert!(!Error::IndexFull { capacity: 10 }.is_retryable());
        assert!(!Error::InvalidVector("empty".to_string()).is_retryable());
    }
}
