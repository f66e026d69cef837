//! `SQLite` schema migrations.
//!
//! Migrations are embedded at compile time and applied in version order when
//! the store opens. Each migration runs in its own transaction together with
//! its row in `schema_migrations`, so a failed migration leaves the schema at
//! the previous version.

use crate::{Error, Result};
use rusqlite::{Connection, params};

/// A single migration with version and SQL.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Migration version (sequential, starting at 1).
    pub version: i32,
    /// Human-readable description.
    pub description: &'static str,
    /// SQL to apply; may contain several statements.
    pub sql: &'static str,
}

/// Schema for the memory record store.
pub const MEMORY_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Create memories table",
        sql: "CREATE TABLE IF NOT EXISTS memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                prompt_text TEXT NOT NULL,
                answer_text TEXT NOT NULL,
                summary_text TEXT,
                embedding BLOB NOT NULL,
                created_at INTEGER NOT NULL
            );",
    },
    Migration {
        version: 2,
        description: "Index memories by session",
        sql: "CREATE INDEX IF NOT EXISTS idx_memories_session ON memories (session_id, id);",
    },
];

/// Applies pending migrations on one connection.
pub struct MigrationRunner<'a> {
    migrations: &'a [Migration],
}

impl<'a> MigrationRunner<'a> {
    /// Creates a runner over `migrations`.
    #[must_use]
    pub const fn new(migrations: &'a [Migration]) -> Self {
        Self { migrations }
    }

    /// Runs every migration newer than the recorded schema version.
    ///
    /// Returns the number of migrations applied.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration statement fails; that migration is
    /// rolled back.
    pub fn run(&self, conn: &mut Connection) -> Result<usize> {
        ensure_migrations_table(conn)?;
        let current = current_version(conn)?;

        let mut applied = 0;
        for migration in self.migrations {
            if migration.version > current {
                apply_migration(conn, migration)?;
                applied += 1;
            }
        }
        Ok(applied)
    }
}

fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        );",
    )
    .map_err(|e| Error::op("create_migrations_table", e))
}

/// Returns the highest applied migration version, or 0 on a fresh database.
///
/// # Errors
///
/// Returns an error if the tracking table exists but cannot be read.
pub fn current_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn
        .query_row(
            "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations')",
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::op("check_migrations_table", e))?;
    if !exists {
        return Ok(0);
    }
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| Error::op("read_schema_version", e))
}

fn apply_migration(conn: &mut Connection, migration: &Migration) -> Result<()> {
    let tx = conn
        .transaction()
        .map_err(|e| Error::op(&format!("migration_v{}_begin_tx", migration.version), e))?;

    tx.execute_batch(migration.sql).map_err(|e| {
        Error::op(
            &format!("migration_v{}: {}", migration.version, migration.description),
            e,
        )
    })?;

    tx.execute(
        "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
        params![
            migration.version,
            migration.description,
            chrono::Utc::now().timestamp()
        ],
    )
    .map_err(|e| Error::op("record_migration", e))?;

    tx.commit()
        .map_err(|e| Error::op(&format!("migration_v{}_commit", migration.version), e))?;

    tracing::info!(
        version = migration.version,
        description = migration.description,
        "Applied migration"
    );
    Ok(())
}

/// Maximum version across a set of migrations.
#[must_use]
pub const fn max_version(migrations: &[Migration]) -> i32 {
    let mut max = 0;
    let mut i = 0;
    while i < migrations.len() {
        if migrations[i].version > max {
            max = migrations[i].version;
        }
        i += 1;
    }
    max
}
