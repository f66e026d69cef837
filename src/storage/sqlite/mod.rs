//! Shared `SQLite` infrastructure for the record store.
//!
//! - `connection`: opening connections and per-connection pragmas
//! - `pool`: the bounded `r2d2` connection pool
//! - `record_row`: row conversion for [`MemoryRecord`](crate::models::MemoryRecord)
//! - `metrics`: operation counters and latency histograms

mod connection;
mod metrics;
mod pool;
mod record_row;

pub use connection::{BUSY_TIMEOUT_MS, acquire_lock, apply_pragmas, open_flags};
pub use metrics::{record_operation_metrics, status_of};
pub use pool::{ConnectionPool, PooledConnection};
pub use record_row::{RECORD_COLUMNS, RecordRow};
