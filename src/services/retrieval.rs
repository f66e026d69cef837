//! Similarity retrieval.
//!
//! Two [`Retriever`] strategies sit behind one coordinator:
//!
//! ```text
//! RetrievalCoordinator::find_similar
//!   ├── SimilarityCache::lookup     (hit → return unchanged)
//!   ├── AnnStrategy::retrieve       (approximate, fast)
//!   └── ExactScanStrategy::retrieve (exact, O(n); only when ANN yields nothing)
//! ```
//!
//! ANN failures are never surfaced: an [`Error::IndexUnavailable`] from the
//! primary strategy is logged and the exact scan answers instead.

use crate::embedding::{VectorCodec, dot};
use crate::models::{ScoredRecord, SessionId};
use crate::services::SimilarityCache;
use crate::storage::{RecordStore, SharedIndex};
use crate::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

/// Minimum candidate count requested from the ANN index for a
/// session-scoped query.
const MIN_SCOPED_CANDIDATES: usize = 32;

/// Candidate multiplier for session-scoped queries.
const SCOPED_OVERSAMPLE: usize = 4;

/// One way of answering a similarity query.
pub trait Retriever: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Returns up to `top_k` records ranked by similarity to `query`.
    ///
    /// `query` is already validated and unit-normalized.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn retrieve(
        &self,
        query: &[f32],
        session: Option<&SessionId>,
        top_k: usize,
    ) -> Result<Vec<ScoredRecord>>;
}

/// Queries the ANN index, then resolves and re-scores ids against the store.
///
/// Ids that no longer resolve (deleted sessions still present in the graph)
/// are dropped, as are records outside the requested session.
pub struct AnnStrategy {
    store: Arc<dyn RecordStore>,
    index: Arc<SharedIndex>,
}

impl AnnStrategy {
    /// Creates the strategy.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, index: Arc<SharedIndex>) -> Self {
        Self { store, index }
    }

    fn candidate_count(&self, session: Option<&SessionId>, top_k: usize) -> usize {
        let stale = self.index.health().stale_count();
        let wanted = if session.is_some() {
            top_k
                .saturating_mul(SCOPED_OVERSAMPLE)
                .max(MIN_SCOPED_CANDIDATES)
        } else {
            top_k
        };
        wanted.saturating_add(stale)
    }
}

impl Retriever for AnnStrategy {
    fn name(&self) -> &'static str {
        "ann"
    }

    #[instrument(
        name = "memvault.retrieval.ann",
        skip(self, query),
        fields(operation = "ann_retrieve", candidates = tracing::field::Empty)
    )]
    fn retrieve(
        &self,
        query: &[f32],
        session: Option<&SessionId>,
        top_k: usize,
    ) -> Result<Vec<ScoredRecord>> {
        if self.index.count() == 0 {
            return Ok(Vec::new());
        }

        let k = self.candidate_count(session, top_k);
        let hits = self.index.query(query, k)?;
        tracing::Span::current().record("candidates", hits.len());

        let mut seen = HashSet::with_capacity(hits.len());
        let ids: Vec<_> = hits
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| seen.insert(*id))
            .collect();

        let mut results: Vec<ScoredRecord> = self
            .store
            .get_many(&ids)?
            .into_iter()
            .filter(|record| session.is_none_or(|s| &record.session_id == s))
            .filter(|record| record.embedding.len() == query.len())
            .map(|record| {
                let score = dot(query, &record.embedding);
                ScoredRecord { record, score }
            })
            .collect();

        ScoredRecord::rank(&mut results, top_k);
        Ok(results)
    }
}

/// Brute-force cosine scan through the record store.
pub struct ExactScanStrategy {
    store: Arc<dyn RecordStore>,
}

impl ExactScanStrategy {
    /// Creates the strategy.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

impl Retriever for ExactScanStrategy {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn retrieve(
        &self,
        query: &[f32],
        session: Option<&SessionId>,
        top_k: usize,
    ) -> Result<Vec<ScoredRecord>> {
        self.store.scan_similar(query, session, top_k)
    }
}

/// Cache, then primary strategy, then fallback strategy.
pub struct RetrievalCoordinator {
    codec: VectorCodec,
    primary: Box<dyn Retriever>,
    fallback: Box<dyn Retriever>,
    cache: Option<SimilarityCache>,
}

impl RetrievalCoordinator {
    /// Creates a coordinator over explicit strategies.
    #[must_use]
    pub fn new(
        codec: VectorCodec,
        primary: Box<dyn Retriever>,
        fallback: Box<dyn Retriever>,
        cache: Option<SimilarityCache>,
    ) -> Self {
        Self {
            codec,
            primary,
            fallback,
            cache,
        }
    }

    /// ANN first, exact scan as fallback.
    #[must_use]
    pub fn with_ann(
        codec: VectorCodec,
        store: Arc<dyn RecordStore>,
        index: Arc<SharedIndex>,
        cache: Option<SimilarityCache>,
    ) -> Self {
        Self::new(
            codec,
            Box::new(AnnStrategy::new(Arc::clone(&store), index)),
            Box::new(ExactScanStrategy::new(store)),
            cache,
        )
    }

    /// The similarity cache, if configured.
    #[must_use]
    pub const fn cache(&self) -> Option<&SimilarityCache> {
        self.cache.as_ref()
    }

    /// Drops cached results; call after every store write.
    pub fn invalidate(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    /// Returns the `top_k` records most similar to `query`.
    ///
    /// An empty or unknown session yields an empty result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for `top_k == 0`,
    /// [`Error::DimensionMismatch`] or [`Error::InvalidVector`] for a bad
    /// query, and store errors from the exact scan.
    #[instrument(
        name = "memvault.retrieval.find_similar",
        skip(self, query),
        fields(operation = "find_similar", path = tracing::field::Empty)
    )]
    pub fn find_similar(
        &self,
        query: &[f32],
        session: Option<&SessionId>,
        top_k: usize,
    ) -> Result<Vec<ScoredRecord>> {
        if top_k == 0 {
            return Err(Error::InvalidInput("top_k must be at least 1".to_string()));
        }
        let query = self.codec.prepare(query)?;
        let start = Instant::now();

        if let Some(cache) = &self.cache
            && let Some(hit) = cache.lookup(&query, session, top_k)
        {
            record_path("cache", start);
            return Ok(hit);
        }
        let generation = self.cache.as_ref().map(SimilarityCache::generation);

        let (path, results) = self.search(&query, session, top_k)?;
        record_path(path, start);

        if let (Some(cache), Some(generation)) = (&self.cache, generation) {
            cache.insert(&query, session, top_k, &results, generation);
        }
        Ok(results)
    }

    fn search(
        &self,
        query: &[f32],
        session: Option<&SessionId>,
        top_k: usize,
    ) -> Result<(&'static str, Vec<ScoredRecord>)> {
        match self.primary.retrieve(query, session, top_k) {
            Ok(results) if !results.is_empty() => return Ok((self.primary.name(), results)),
            Ok(_) => {
                tracing::debug!(
                    strategy = self.primary.name(),
                    "Primary retrieval returned nothing, falling back"
                );
            },
            Err(Error::IndexUnavailable(reason)) => {
                tracing::warn!(
                    strategy = self.primary.name(),
                    reason = %reason,
                    "ANN index unavailable, falling back to exact scan"
                );
            },
            Err(Error::DimensionMismatch { expected, actual }) => {
                tracing::warn!(
                    strategy = self.primary.name(),
                    expected,
                    actual,
                    "ANN index dimension mismatch, falling back to exact scan"
                );
            },
            Err(e) => return Err(e),
        }

        let results = self.fallback.retrieve(query, session, top_k)?;
        Ok((self.fallback.name(), results))
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_path(path: &'static str, start: Instant) {
    tracing::Span::current().record("path", path);
    metrics::counter!("retrieval_path_total", "path" => path).increment(1);
    metrics::histogram!("retrieval_duration_ms", "path" => path)
        .record(start.elapsed().as_millis() as f64);
}
