//! Bounded `SQLite` connection pool on `r2d2`.
//!
//! The pool keeps `size` connections open and opens up to `overflow` more
//! under load; the extras are reaped after [`OVERFLOW_IDLE_TIMEOUT`]. When
//! every connection stays checked out for the acquire timeout the caller
//! gets [`Error::PoolExhausted`] instead of blocking.

use super::connection::{apply_pragmas, open_flags};
use crate::config::PoolConfig;
use crate::{Error, Result};
use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// How long a connection above `size` may sit idle before it is closed.
pub const OVERFLOW_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// A checked-out connection, returned to the pool on drop.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Runs the shared pragmas on every connection the pool opens.
#[derive(Debug)]
struct SqlitePragmas;

impl CustomizeConnection<Connection, rusqlite::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        apply_pragmas(conn)
    }
}

/// A bounded pool of configured connections to one database file.
#[derive(Clone)]
pub struct ConnectionPool {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
    config: PoolConfig,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.pool.state();
        f.debug_struct("ConnectionPool")
            .field("path", &self.path)
            .field("config", &self.config)
            .field("connections", &state.connections)
            .field("idle", &state.idle_connections)
            .finish()
    }
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

impl ConnectionPool {
    /// Creates a pool for the database at `path`.
    ///
    /// The `size` resident connections are opened in the background; a
    /// checkout waits for one like any other.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, config: PoolConfig) -> Self {
        let path = path.into();
        let capacity = to_u32(config.capacity().max(1));
        let manager = SqliteConnectionManager::file(&path).with_flags(open_flags());
        let pool = Pool::builder()
            .max_size(capacity)
            .min_idle(Some(to_u32(config.size).min(capacity)))
            .idle_timeout(Some(OVERFLOW_IDLE_TIMEOUT))
            .connection_timeout(config.acquire_timeout().max(Duration::from_millis(1)))
            .connection_customizer(Box::new(SqlitePragmas))
            .build_unchecked(manager);
        Self { pool, path, config }
    }

    /// Database file the pool connects to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total connections that may be checked out at once.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.pool.max_size() as usize
    }

    /// Connections currently open, checked out or idle.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.pool.state().connections as usize
    }

    /// Connections currently open and waiting for reuse.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.pool.state().idle_connections as usize
    }

    /// Checks out a connection, waiting up to the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] if every connection stays checked out
    /// for the whole timeout, or [`Error::OperationFailed`] if a new
    /// connection cannot be opened.
    pub fn get(&self) -> Result<PooledConnection> {
        let start = Instant::now();
        match self.pool.get() {
            Ok(conn) => {
                self.record_in_use();
                Ok(conn)
            },
            Err(e) => Err(self.checkout_error(start, &e)),
        }
    }

    fn checkout_error(&self, start: Instant, err: &r2d2::Error) -> Error {
        let state = self.pool.state();
        // r2d2 reports both outcomes as a timeout; a full pool with nothing
        // idle means every connection was held.
        if state.connections >= self.pool.max_size() && state.idle_connections == 0 {
            let waited_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
            metrics::counter!("pool_acquire_timeouts_total").increment(1);
            tracing::warn!(
                waited_ms,
                capacity = self.capacity(),
                "Connection pool exhausted"
            );
            return Error::PoolExhausted {
                waited_ms,
                capacity: self.capacity(),
            };
        }
        Error::op("open_sqlite", format!("{}: {err}", self.path.display()))
    }

    fn record_in_use(&self) {
        let state = self.pool.state();
        let in_use = state.connections.saturating_sub(state.idle_connections);
        metrics::gauge!("pool_connections_in_use").set(f64::from(in_use));
    }
}
