//! Approximate nearest-neighbor index backends.
//!
//! The default backend is an `hnsw_rs` graph. Building with the
//! `usearch-hnsw` feature swaps in the native usearch library.

mod health;
mod hnsw;
mod shared;
mod snapshot;
#[cfg(feature = "usearch-hnsw")]
mod usearch;

pub use health::{IndexHealth, RebuildPolicy};
pub use hnsw::HnswIndex;
pub use shared::{SharedIndex, SlotReservation};
pub use snapshot::{SNAPSHOT_FORMAT_VERSION, SnapshotHeader};
#[cfg(feature = "usearch-hnsw")]
pub use usearch::UsearchIndex;

use crate::Result;
use crate::storage::traits::{AnnIndex, AnnParams};

/// Creates an empty index with the backend selected at compile time.
///
/// # Errors
///
/// Returns an error if the native backend cannot allocate the index.
#[cfg(feature = "usearch-hnsw")]
pub fn new_index(params: AnnParams) -> Result<Box<dyn AnnIndex>> {
    Ok(Box::new(UsearchIndex::new(params)?))
}

/// Creates an empty index with the backend selected at compile time.
///
/// # Errors
///
/// Never fails for the `hnsw_rs` backend.
#[cfg(not(feature = "usearch-hnsw"))]
#[allow(clippy::unnecessary_wraps)]
pub fn new_index(params: AnnParams) -> Result<Box<dyn AnnIndex>> {
    Ok(Box::new(HnswIndex::new(params)))
}
