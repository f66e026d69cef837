//! Storage layer.
//!
//! Two layers with different guarantees:
//! - **Record store**: `SQLite`, durable and authoritative
//! - **ANN index**: in-memory HNSW, derived from the store and rebuildable

// Allow cast precision loss for score and gauge calculations.
#![allow(clippy::cast_precision_loss)]
// Allow significant_drop_tightening - dropping pooled connections slightly early
// provides no meaningful benefit.
#![allow(clippy::significant_drop_tightening)]

pub mod migrations;
pub mod persistence;
pub mod sqlite;
pub mod traits;
pub mod vector;

pub use persistence::SqliteRecordStore;
pub use traits::{AnnIndex, AnnParams, RecordStore};
pub use vector::{HnswIndex, IndexHealth, RebuildPolicy, SharedIndex, SlotReservation, new_index};
