//! Configuration management.
//!
//! Configuration is assembled once at process start from built-in defaults,
//! an optional TOML file and `MEMVAULT_*` environment overrides, and is
//! immutable for the life of a running instance.

use crate::embedding::DEFAULT_EMBED_DIM;
use crate::observability::{LogFormat, LoggingConfig};
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for memvault.
#[derive(Debug, Clone)]
pub struct MemvaultConfig {
    /// Embedding dimension for the whole deployment.
    pub embed_dim: usize,
    /// Directory holding the database and index snapshot.
    pub data_dir: PathBuf,
    /// Database file name, relative to `data_dir`.
    pub database_file: String,
    /// ANN snapshot file name, relative to `data_dir`.
    pub snapshot_file: String,
    /// Connection pool settings.
    pub pool: PoolConfig,
    /// ANN index construction parameters.
    pub ann: AnnConfig,
    /// Similarity cache settings.
    pub cache: CacheConfig,
    /// Maximum byte length of prompt, answer and summary text.
    pub max_text_len: usize,
    /// Truncate/pad mismatched embeddings at the API boundary instead of failing.
    pub coerce_embeddings: bool,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Metrics exporter settings.
    pub metrics: MetricsConfig,
}

/// Connection pool configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections kept open and reused.
    pub size: usize,
    /// Extra connections opened under load and closed once idle.
    pub overflow: usize,
    /// How long to wait for a connection before failing.
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 5,
            overflow: 10,
            acquire_timeout_ms: 30_000,
        }
    }
}

impl PoolConfig {
    /// Total connections that may be checked out at once.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.size + self.overflow
    }

    /// Acquire timeout as a [`Duration`].
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// ANN index construction parameters.
///
/// `m`, `ef_construction` and `ef` together set the recall/latency/memory
/// trade-off and should be tuned together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnConfig {
    /// Maximum number of vectors the index accepts.
    pub max_elements: usize,
    /// Graph connectivity (M).
    pub m: usize,
    /// Build-time search breadth.
    pub ef_construction: usize,
    /// Query-time search breadth.
    pub ef: usize,
    /// Stale (deleted but still indexed) entries tolerated before a rebuild.
    pub rebuild_stale_threshold: usize,
}

impl Default for AnnConfig {
    fn default() -> Self {
        Self {
            max_elements: 100_000,
            m: 16,
            ef_construction: 200,
            ef: 50,
            rebuild_stale_threshold: 1,
        }
    }
}

/// Similarity cache configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheConfig {
    /// Whether the cache is consulted at all.
    pub enabled: bool,
    /// Minimum cosine similarity between queries for a hit.
    pub threshold: f32,
    /// Maximum cached queries.
    pub capacity: usize,
    /// Entry lifetime in seconds.
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.98,
            capacity: 256,
            ttl_secs: 300,
        }
    }
}

/// Prometheus exporter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsConfig {
    /// Whether to install the exporter.
    pub enabled: bool,
    /// Port for the scrape listener.
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Embedding dimension.
    pub embed_dim: Option<usize>,
    /// Data directory.
    pub data_dir: Option<String>,
    /// Database file name.
    pub database_file: Option<String>,
    /// Snapshot file name.
    pub snapshot_file: Option<String>,
    /// Max text length.
    pub max_text_len: Option<usize>,
    /// Coerce embeddings.
    pub coerce_embeddings: Option<bool>,
    /// Pool section.
    pub pool: Option<ConfigFilePool>,
    /// ANN section.
    pub ann: Option<ConfigFileAnn>,
    /// Cache section.
    pub cache: Option<ConfigFileCache>,
    /// Logging section.
    pub logging: Option<ConfigFileLogging>,
    /// Metrics section.
    pub metrics: Option<ConfigFileMetrics>,
}

/// Pool section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFilePool {
    /// Pool size.
    pub size: Option<usize>,
    /// Overflow allowance.
    pub overflow: Option<usize>,
    /// Acquire timeout.
    pub acquire_timeout_ms: Option<u64>,
}

/// ANN section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileAnn {
    /// Capacity.
    pub max_elements: Option<usize>,
    /// Connectivity.
    pub m: Option<usize>,
    /// Build breadth.
    pub ef_construction: Option<usize>,
    /// Query breadth.
    pub ef: Option<usize>,
    /// Rebuild threshold.
    pub rebuild_stale_threshold: Option<usize>,
}

/// Cache section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileCache {
    /// Enabled flag.
    pub enabled: Option<bool>,
    /// Similarity threshold.
    pub threshold: Option<f32>,
    /// Capacity.
    pub capacity: Option<usize>,
    /// TTL.
    pub ttl_secs: Option<u64>,
}

/// Logging section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileLogging {
    /// Filter directive, e.g. `info` or `memvault=debug`.
    pub level: Option<String>,
    /// `pretty` or `json`.
    pub format: Option<String>,
    /// Optional log file.
    pub file: Option<String>,
}

/// Metrics section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileMetrics {
    /// Enabled flag.
    pub enabled: Option<bool>,
    /// Listener port.
    pub port: Option<u16>,
}

impl Default for MemvaultConfig {
    fn default() -> Self {
        Self {
            embed_dim: DEFAULT_EMBED_DIM,
            data_dir: default_data_dir(),
            database_file: "memories.db".to_string(),
            snapshot_file: "ann_index.snapshot".to_string(),
            pool: PoolConfig::default(),
            ann: AnnConfig::default(),
            cache: CacheConfig::default(),
            max_text_len: 100_000,
            coerce_embeddings: false,
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Platform data directory, falling back to `./.memvault`.
fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "memvault").map_or_else(
        || PathBuf::from(".memvault"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}

impl MemvaultConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file path, then applies env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// resulting configuration is invalid.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::OperationFailed {
            operation: "read_config_file".to_string(),
            cause: format!("{}: {e}", path.display()),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parses TOML configuration, then applies env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(contents).map_err(|e| Error::OperationFailed {
            operation: "parse_config_file".to_string(),
            cause: e.to_string(),
        })?;
        let config = Self::from_config_file(file).with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from the default location.
    ///
    /// Checks `<config dir>/memvault/config.toml`; returns defaults with
    /// env overrides if the file is absent or unreadable.
    #[must_use]
    pub fn load_default() -> Self {
        if let Some(dirs) = directories::ProjectDirs::from("", "", "memvault") {
            let path = dirs.config_dir().join("config.toml");
            if path.exists() {
                match Self::load_from_file(&path) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Ignoring invalid config file");
                    },
                }
            }
        }
        Self::default().with_env_overrides()
    }

    /// Converts a `ConfigFile` to `MemvaultConfig`.
    fn from_config_file(file: ConfigFile) -> Self {
        let mut config = Self::default();

        if let Some(v) = file.embed_dim {
            config.embed_dim = v;
        }
        if let Some(v) = file.data_dir {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = file.database_file {
            config.database_file = v;
        }
        if let Some(v) = file.snapshot_file {
            config.snapshot_file = v;
        }
        if let Some(v) = file.max_text_len {
            config.max_text_len = v;
        }
        if let Some(v) = file.coerce_embeddings {
            config.coerce_embeddings = v;
        }
        if let Some(pool) = file.pool {
            config.pool.size = pool.size.unwrap_or(config.pool.size);
            config.pool.overflow = pool.overflow.unwrap_or(config.pool.overflow);
            config.pool.acquire_timeout_ms = pool
                .acquire_timeout_ms
                .unwrap_or(config.pool.acquire_timeout_ms);
        }
        if let Some(ann) = file.ann {
            config.ann.max_elements = ann.max_elements.unwrap_or(config.ann.max_elements);
            config.ann.m = ann.m.unwrap_or(config.ann.m);
            config.ann.ef_construction = ann.ef_construction.unwrap_or(config.ann.ef_construction);
            config.ann.ef = ann.ef.unwrap_or(config.ann.ef);
            config.ann.rebuild_stale_threshold = ann
                .rebuild_stale_threshold
                .unwrap_or(config.ann.rebuild_stale_threshold);
        }
        if let Some(cache) = file.cache {
            config.cache.enabled = cache.enabled.unwrap_or(config.cache.enabled);
            config.cache.threshold = cache.threshold.unwrap_or(config.cache.threshold);
            config.cache.capacity = cache.capacity.unwrap_or(config.cache.capacity);
            config.cache.ttl_secs = cache.ttl_secs.unwrap_or(config.cache.ttl_secs);
        }
        if let Some(logging) = file.logging {
            if let Some(level) = logging.level {
                config.logging.filter = level;
            }
            if let Some(format) = logging.format {
                config.logging.format = LogFormat::parse(&format);
            }
            config.logging.file = logging.file.map(PathBuf::from);
        }
        if let Some(metrics) = file.metrics {
            config.metrics.enabled = metrics.enabled.unwrap_or(config.metrics.enabled);
            config.metrics.port = metrics.port.unwrap_or(config.metrics.port);
        }

        config
    }

    /// Applies environment variable overrides.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `MEMVAULT_EMBED_DIM` | `embed_dim` |
    /// | `MEMVAULT_DATA_DIR` | `data_dir` |
    /// | `MEMVAULT_POOL_SIZE` | `pool.size` |
    /// | `MEMVAULT_POOL_OVERFLOW` | `pool.overflow` |
    /// | `MEMVAULT_POOL_TIMEOUT_MS` | `pool.acquire_timeout_ms` |
    /// | `MEMVAULT_ANN_MAX_ELEMENTS` | `ann.max_elements` |
    /// | `MEMVAULT_ANN_M` | `ann.m` |
    /// | `MEMVAULT_ANN_EF_CONSTRUCTION` | `ann.ef_construction` |
    /// | `MEMVAULT_ANN_EF` | `ann.ef` |
    /// | `MEMVAULT_CACHE_ENABLED` | `cache.enabled` |
    /// | `MEMVAULT_CACHE_THRESHOLD` | `cache.threshold` |
    /// | `MEMVAULT_CACHE_CAPACITY` | `cache.capacity` |
    /// | `MEMVAULT_CACHE_TTL_SECS` | `cache.ttl_secs` |
    /// | `MEMVAULT_COERCE_EMBEDDINGS` | `coerce_embeddings` |
    /// | `MEMVAULT_LOG` | `logging.filter` |
    /// | `MEMVAULT_LOG_FORMAT` | `logging.format` |
    /// | `MEMVAULT_METRICS_ENABLED` | `metrics.enabled` |
    /// | `MEMVAULT_METRICS_PORT` | `metrics.port` |
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies the [`with_env_overrides`](Self::with_env_overrides) table,
    /// reading each variable through `lookup`.
    #[must_use]
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = parse(lookup("MEMVAULT_EMBED_DIM")) {
            self.embed_dim = v;
        }
        if let Some(v) = lookup("MEMVAULT_DATA_DIR")
            && !v.is_empty()
        {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = parse(lookup("MEMVAULT_POOL_SIZE")) {
            self.pool.size = v;
        }
        if let Some(v) = parse(lookup("MEMVAULT_POOL_OVERFLOW")) {
            self.pool.overflow = v;
        }
        if let Some(v) = parse(lookup("MEMVAULT_POOL_TIMEOUT_MS")) {
            self.pool.acquire_timeout_ms = v;
        }
        if let Some(v) = parse(lookup("MEMVAULT_ANN_MAX_ELEMENTS")) {
            self.ann.max_elements = v;
        }
        if let Some(v) = parse(lookup("MEMVAULT_ANN_M")) {
            self.ann.m = v;
        }
        if let Some(v) = parse(lookup("MEMVAULT_ANN_EF_CONSTRUCTION")) {
            self.ann.ef_construction = v;
        }
        if let Some(v) = parse(lookup("MEMVAULT_ANN_EF")) {
            self.ann.ef = v;
        }
        if let Some(v) = parse_bool(lookup("MEMVAULT_CACHE_ENABLED")) {
            self.cache.enabled = v;
        }
        if let Some(v) = parse(lookup("MEMVAULT_CACHE_THRESHOLD")) {
            self.cache.threshold = v;
        }
        if let Some(v) = parse(lookup("MEMVAULT_CACHE_CAPACITY")) {
            self.cache.capacity = v;
        }
        if let Some(v) = parse(lookup("MEMVAULT_CACHE_TTL_SECS")) {
            self.cache.ttl_secs = v;
        }
        if let Some(v) = parse_bool(lookup("MEMVAULT_COERCE_EMBEDDINGS")) {
            self.coerce_embeddings = v;
        }
        if let Some(v) = lookup("MEMVAULT_LOG")
            && !v.is_empty()
        {
            self.logging.filter = v;
        }
        if let Some(v) = lookup("MEMVAULT_LOG_FORMAT") {
            self.logging.format = LogFormat::parse(&v);
        }
        if let Some(v) = parse_bool(lookup("MEMVAULT_METRICS_ENABLED")) {
            self.metrics.enabled = v;
        }
        if let Some(v) = parse(lookup("MEMVAULT_METRICS_PORT")) {
            self.metrics.port = v;
        }
        self
    }

    /// Checks that the configuration describes a usable engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| -> Result<()> { Err(Error::InvalidInput(msg.to_string())) };
        if self.embed_dim == 0 {
            return fail("embed_dim must be at least 1");
        }
        if self.pool.size == 0 {
            return fail("pool.size must be at least 1");
        }
        if self.ann.max_elements == 0 {
            return fail("ann.max_elements must be at least 1");
        }
        if self.ann.m < 2 {
            return fail("ann.m must be at least 2");
        }
        if self.ann.ef == 0 || self.ann.ef_construction == 0 {
            return fail("ann.ef and ann.ef_construction must be at least 1");
        }
        if !(self.cache.threshold > 0.0 && self.cache.threshold <= 1.0) {
            return fail("cache.threshold must be in (0, 1]");
        }
        if self.cache.enabled && self.cache.capacity == 0 {
            return fail("cache.capacity must be at least 1 when the cache is enabled");
        }
        Ok(())
    }

    /// Full path of the record database.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    /// Full path of the ANN snapshot.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(&self.snapshot_file)
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Sets the embedding dimension.
    #[must_use]
    pub const fn with_embed_dim(mut self, dim: usize) -> Self {
        self.embed_dim = dim;
        self
    }
}

fn parse<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

fn parse_bool(value: Option<String>) -> Option<bool> {
    value.map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> MemvaultConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        MemvaultConfig::default().with_overrides_from(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_env_overrides_cover_cache_settings() {
        let config = overrides(&[
            ("MEMVAULT_CACHE_ENABLED", "false"),
            ("MEMVAULT_CACHE_THRESHOLD", "0.9"),
            ("MEMVAULT_CACHE_CAPACITY", "32"),
            ("MEMVAULT_CACHE_TTL_SECS", "45"),
        ]);
        assert!(!config.cache.enabled);
        assert!((config.cache.threshold - 0.9).abs() < f32::EPSILON);
        assert_eq!(config.cache.capacity, 32);
        assert_eq!(config.cache.ttl_secs, 45);
    }

    #[test]
    fn test_unparsable_env_override_keeps_default() {
        let config = overrides(&[
            ("MEMVAULT_CACHE_TTL_SECS", "soon"),
            ("MEMVAULT_POOL_SIZE", " 7 "),
        ]);
        assert_eq!(config.cache.ttl_secs, CacheConfig::default().ttl_secs);
        assert_eq!(config.pool.size, 7);
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = MemvaultConfig::default();
        assert_eq!(config.embed_dim, 768);
        assert_eq!(config.pool.capacity(), 15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_config_file_sections() {
        let file: ConfigFile = toml::from_str(
            r#"
            embed_dim = 384
            data_dir = "/tmp/memvault-test"
            coerce_embeddings = true

            [pool]
            size = 2
            overflow = 1
            acquire_timeout_ms = 250

            [ann]
            max_elements = 5000
            m = 8

            [cache]
            enabled = false

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        let config = MemvaultConfig::from_config_file(file);

        assert_eq!(config.embed_dim, 384);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/memvault-test"));
        assert!(config.coerce_embeddings);
        assert_eq!(config.pool.capacity(), 3);
        assert_eq!(config.pool.acquire_timeout(), Duration::from_millis(250));
        assert_eq!(config.ann.max_elements, 5000);
        assert_eq!(config.ann.m, 8);
        assert_eq!(config.ann.ef, AnnConfig::default().ef);
        assert!(!config.cache.enabled);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(toml::from_str::<ConfigFile>("bogus = 1").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(MemvaultConfig::default().with_embed_dim(0).validate().is_err());

        let mut config = MemvaultConfig::default();
        config.pool.size = 0;
        assert!(config.validate().is_err());

        let mut config = MemvaultConfig::default();
        config.cache.threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = MemvaultConfig::default();
        config.ann.m = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_paths() {
        let config = MemvaultConfig::default().with_data_dir("/data");
        assert_eq!(config.database_path(), PathBuf::from("/data/memories.db"));
        assert_eq!(
            config.snapshot_path(),
            PathBuf::from("/data/ann_index.snapshot")
        );
    }
}
