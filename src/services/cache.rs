//! Similarity cache.
//!
//! Memoizes recent `(query, results)` pairs in an in-memory LRU with
//! TTL-based expiration. A lookup hits when a cached query in the same
//! session scope with the same `top_k` has cosine similarity at or above
//! the threshold; the cached results are returned unchanged.
//!
//! # Consistency
//!
//! Every write to the store clears the cache and bumps a generation
//! counter. A result computed under an older generation is never
//! inserted, so a hit never predates the last write.
//!
//! # Lock Poisoning
//!
//! Fail-open: a poisoned lock makes lookups miss and inserts no-ops.

use crate::config::CacheConfig;
use crate::embedding::dot;
use crate::models::{ScoredRecord, SessionId};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::instrument;

#[derive(Debug, Clone)]
struct CacheEntry {
    scope: Option<SessionId>,
    top_k: usize,
    query: Vec<f32>,
    results: Vec<ScoredRecord>,
    cached_at: Instant,
}

impl CacheEntry {
    fn matches(&self, scope: Option<&SessionId>, top_k: usize) -> bool {
        self.top_k == top_k && self.scope.as_ref() == scope
    }
}

struct CacheState {
    entries: LruCache<u64, CacheEntry>,
    next_key: u64,
}

/// Near-duplicate query cache.
pub struct SimilarityCache {
    state: RwLock<CacheState>,
    threshold: f32,
    ttl: Duration,
    generation: AtomicU64,
}

impl SimilarityCache {
    /// Creates a cache holding up to `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if capacity is 0.
    #[must_use]
    #[allow(clippy::expect_used)] // Documented panic for invalid input
    pub fn new(capacity: usize, threshold: f32, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity).expect("capacity must be > 0");
        Self {
            state: RwLock::new(CacheState {
                entries: LruCache::new(cap),
                next_key: 0,
            }),
            threshold,
            ttl,
            generation: AtomicU64::new(0),
        }
    }

    /// Builds a cache from configuration, or `None` when disabled.
    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Option<Self> {
        (config.enabled && config.capacity > 0).then(|| {
            Self::new(
                config.capacity,
                config.threshold,
                Duration::from_secs(config.ttl_secs),
            )
        })
    }

    /// Current write generation; pass it back to [`SimilarityCache::insert`].
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Number of cached entries, including expired ones not yet evicted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().map_or(0, |state| state.entries.len())
    }

    /// True when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns cached results for a query close enough to `query`.
    ///
    /// `query` must be unit-normalized.
    #[instrument(skip(self, query), fields(operation = "cache_lookup"))]
    pub fn lookup(
        &self,
        query: &[f32],
        scope: Option<&SessionId>,
        top_k: usize,
    ) -> Option<Vec<ScoredRecord>> {
        let best = {
            let state = self.state.read().ok()?;
            state
                .entries
                .iter()
                .filter(|(_, entry)| {
                    entry.matches(scope, top_k)
                        && entry.cached_at.elapsed() <= self.ttl
                        && entry.query.len() == query.len()
                })
                .map(|(&key, entry)| (key, dot(&entry.query, query)))
                .filter(|&(_, similarity)| similarity >= self.threshold)
                .max_by(|a, b| a.1.total_cmp(&b.1))
        };

        let Some((key, similarity)) = best else {
            metrics::counter!("similarity_cache_misses_total").increment(1);
            return None;
        };

        let mut state = self.state.write().ok()?;
        let results = state.entries.get(&key).map(|entry| entry.results.clone());
        if results.is_some() {
            metrics::counter!("similarity_cache_hits_total").increment(1);
            tracing::debug!(similarity, "Similarity cache hit");
        } else {
            metrics::counter!("similarity_cache_misses_total").increment(1);
        }
        results
    }

    /// Caches `results` for `query`, unless a write happened since
    /// `generation` was read.
    pub fn insert(
        &self,
        query: &[f32],
        scope: Option<&SessionId>,
        top_k: usize,
        results: &[ScoredRecord],
        generation: u64,
    ) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        if self.generation() != generation {
            tracing::debug!("Skipping cache insert after concurrent write");
            return;
        }

        let ttl = self.ttl;
        let expired: Vec<u64> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.cached_at.elapsed() > ttl)
            .map(|(&key, _)| key)
            .collect();
        for key in expired {
            state.entries.pop(&key);
        }

        let key = state.next_key;
        state.next_key = state.next_key.wrapping_add(1);
        state.entries.put(
            key,
            CacheEntry {
                scope: scope.cloned(),
                top_k,
                query: query.to_vec(),
                results: results.to_vec(),
                cached_at: Instant::now(),
            },
        );
    }

    /// Drops every entry and invalidates in-flight inserts.
    pub fn clear(&self) {
        match self.state.write() {
            Ok(mut state) => {
                self.generation.fetch_add(1, Ordering::AcqRel);
                state.entries.clear();
            },
            Err(_) => {
                self.generation.fetch_add(1, Ordering::AcqRel);
                tracing::warn!("Similarity cache lock poisoned; entries not cleared");
            },
        }
    }
}

impl std::fmt::Debug for SimilarityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimilarityCache")
            .field("len", &self.len())
            .field("threshold", &self.threshold)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
