//! Storage traits.

mod ann;
mod store;

pub use ann::{AnnIndex, AnnParams};
pub use store::RecordStore;
