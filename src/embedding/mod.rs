//! Embedding vectors.
//!
//! Memvault never generates embeddings itself: callers supply them
//! pre-computed. This module owns the vector codec that validates,
//! normalizes and serializes them.

// Allow cast precision loss for f64 norm accumulation.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

mod codec;

pub use codec::{
    NUDGE_COMPONENT, VectorCodec, decode, dot, encode, l2_norm, normalize, sanitize,
};

/// Default embedding dimension for the deployment.
pub const DEFAULT_EMBED_DIM: usize = 768;
