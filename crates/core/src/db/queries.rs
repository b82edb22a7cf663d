//! Typed query helpers for the run-history table.

use chrono::SecondsFormat;
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;
use crate::summary::{RunStatus, RunSummary};

/// A row from the `runs` table, without the full summary payload.
#[derive(Debug, Clone)]
pub struct RunEntry {
    pub id: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: String,
    pub direction: String,
    pub dry_run: bool,
    pub store_a: String,
    pub store_b: String,
    pub matched: i64,
    pub total_writes: i64,
    pub conflicts: i64,
    pub errors: i64,
    pub fatal_error: Option<String>,
}

impl RunEntry {
    pub fn status(&self) -> Option<RunStatus> {
        RunStatus::from_str_val(&self.status)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            started_at: row.get(1)?,
            completed_at: row.get(2)?,
            status: row.get(3)?,
            direction: row.get(4)?,
            dry_run: row.get::<_, i64>(5)? != 0,
            store_a: row.get(6)?,
            store_b: row.get(7)?,
            matched: row.get(8)?,
            total_writes: row.get(9)?,
            conflicts: row.get(10)?,
            errors: row.get(11)?,
            fatal_error: row.get(12)?,
        })
    }
}

const RUN_COLUMNS: &str = "id, started_at, completed_at, status, direction, dry_run, store_a, \
     store_b, matched, total_writes, conflicts, errors, fatal_error";

impl Database {
    /// Append a finished run.
    pub fn insert_run(&self, summary: &RunSummary) -> Result<(), DatabaseError> {
        let json = serde_json::to_string(summary)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO runs (id, started_at, completed_at, status, direction, dry_run, store_a,
                               store_b, matched, total_writes, conflicts, errors, fatal_error,
                               summary_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                summary.run_id.to_string(),
                summary.started_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                summary.completed_at
                    .map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true)),
                summary.status.to_string(),
                summary.direction.to_string(),
                summary.dry_run as i64,
                summary.store_a,
                summary.store_b,
                summary.matched as i64,
                summary.total_writes() as i64,
                summary.conflicts.len() as i64,
                summary.errors.len() as i64,
                summary.fatal_error,
                json,
            ],
        )?;
        debug!(run_id = %summary.run_id, status = %summary.status, "recorded run");
        Ok(())
    }

    /// The most recent `limit` runs, newest first.
    pub fn list_runs(&self, limit: u32) -> Result<Vec<RunEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs ORDER BY started_at DESC, rowid DESC LIMIT ?1",
            RUN_COLUMNS
        ))?;
        let entries = stmt
            .query_map(params![limit], RunEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Load the full summary of a run by id or unique id prefix.
    pub fn get_run(&self, id: &str) -> Result<RunSummary, DatabaseError> {
        let conn = self.conn();
        let exact: Option<String> = conn
            .query_row(
                "SELECT summary_json FROM runs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        let json = match exact {
            Some(json) => json,
            None => {
                let mut stmt = conn.prepare(
                    "SELECT summary_json FROM runs WHERE id LIKE ?1 || '%' ESCAPE '\\' LIMIT 2",
                )?;
                let pattern = id.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
                let mut matches = stmt
                    .query_map(params![pattern], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                match matches.len() {
                    1 => matches.remove(0),
                    0 => {
                        return Err(DatabaseError::NotFound {
                            entity: "run".into(),
                            id: id.into(),
                        })
                    }
                    _ => {
                        return Err(DatabaseError::NotFound {
                            entity: "unique run".into(),
                            id: format!("{} (prefix is ambiguous)", id),
                        })
                    }
                }
            }
        };

        Ok(serde_json::from_str(&json)?)
    }

    /// The full summary of the most recent run, if any.
    pub fn latest_run(&self) -> Result<Option<RunSummary>, DatabaseError> {
        let conn = self.conn();
        let json: Option<String> = conn
            .query_row(
                "SELECT summary_json FROM runs ORDER BY started_at DESC, rowid DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j))
            .transpose()
            .map_err(DatabaseError::from)
    }

    /// Number of stored runs.
    pub fn count_runs(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count = conn.query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Delete all but the newest `keep` runs. Returns the number removed.
    pub fn prune_runs(&self, keep: u32) -> Result<usize, DatabaseError> {
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM runs WHERE id NOT IN (
                 SELECT id FROM runs ORDER BY started_at DESC, rowid DESC LIMIT ?1
             )",
            params![keep],
        )?;
        if removed > 0 {
            debug!(removed, keep, "pruned run history");
        }
        Ok(removed)
    }
}
