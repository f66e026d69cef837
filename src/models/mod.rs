//! Data models for memvault.
//!
//! This module contains the core data structures shared by the store,
//! the ANN index and the retrieval services.

mod record;
mod search;
mod session;

pub use record::{MemoryRecord, NewMemory, RecordId};
pub use search::ScoredRecord;
pub use session::{MAX_SESSION_ID_LEN, SessionId};
