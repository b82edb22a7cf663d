//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The SQLite
//! `user_version` pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "run history",
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id            TEXT PRIMARY KEY,
            started_at    TEXT    NOT NULL,
            completed_at  TEXT,
            status        TEXT    NOT NULL CHECK (status IN ('success', 'partial_failure', 'failed')),
            direction     TEXT    NOT NULL,
            dry_run       INTEGER NOT NULL DEFAULT 0,
            store_a       TEXT    NOT NULL,
            store_b       TEXT    NOT NULL,
            matched       INTEGER NOT NULL DEFAULT 0,
            total_writes  INTEGER NOT NULL DEFAULT 0,
            conflicts     INTEGER NOT NULL DEFAULT 0,
            errors        INTEGER NOT NULL DEFAULT 0,
            fatal_error   TEXT,
            summary_json  TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs (started_at);
        "#,
    ),
    (
        2,
        "index runs by status",
        r#"
        CREATE INDEX IF NOT EXISTS idx_runs_status ON runs (status);
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied");
        }
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
