//! Business logic services.
//!
//! Services orchestrate the record store and the ANN index and provide the
//! operations the API layer calls.

mod bootstrap;
mod cache;
mod memory;
mod retrieval;

pub use bootstrap::{BootstrapOutcome, BootstrapReport, IndexBootstrapper};
pub use cache::SimilarityCache;
pub use memory::{MemoryService, ServiceStatus};
pub use retrieval::{AnnStrategy, ExactScanStrategy, RetrievalCoordinator, Retriever};
