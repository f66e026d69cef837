//! Record store implementations.

mod sqlite;

pub use sqlite::SqliteRecordStore;
