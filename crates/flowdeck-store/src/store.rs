use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use tracing::debug;

use flowdeck_core::error::{FlowError, Result};
use flowdeck_core::types::ExecutionStatus;

/// SQLite-backed store for definitions, versions and execution records.
///
/// One connection behind a mutex; every trait call locks, runs its
/// statements synchronously, and releases before returning.
pub struct SqliteStore {
    pub(crate) conn: Mutex<Connection>,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS definitions (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        draft TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS definition_versions (
        id TEXT PRIMARY KEY,
        definition_id TEXT NOT NULL REFERENCES definitions(id),
        version INTEGER NOT NULL,
        graph TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        UNIQUE (definition_id, version)
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_versions_one_active
        ON definition_versions(definition_id) WHERE is_active = 1;

    CREATE INDEX IF NOT EXISTS idx_versions_definition
        ON definition_versions(definition_id, created_at DESC);

    CREATE TABLE IF NOT EXISTS scenario_executions (
        id TEXT PRIMARY KEY,
        scenario_id TEXT NOT NULL,
        definition_version_id TEXT NOT NULL,
        status TEXT NOT NULL,
        input TEXT NOT NULL,
        output TEXT,
        error TEXT,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        duration_ms INTEGER,
        conversation_id TEXT,
        triggered_by TEXT
    );

    CREATE TABLE IF NOT EXISTS agent_executions (
        id TEXT PRIMARY KEY,
        scenario_execution_id TEXT REFERENCES scenario_executions(id),
        agent_id TEXT NOT NULL,
        definition_version_id TEXT NOT NULL,
        orchestration_node_id TEXT,
        status TEXT NOT NULL,
        input TEXT NOT NULL,
        output TEXT,
        error TEXT,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        duration_ms INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_agent_exec_parent
        ON agent_executions(scenario_execution_id, started_at);

    CREATE TABLE IF NOT EXISTS step_executions (
        id TEXT PRIMARY KEY,
        agent_execution_id TEXT NOT NULL REFERENCES agent_executions(id),
        step_index INTEGER NOT NULL,
        node_id TEXT NOT NULL,
        node_type TEXT NOT NULL,
        status TEXT NOT NULL,
        input TEXT NOT NULL,
        output TEXT,
        error TEXT,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        duration_ms INTEGER,
        UNIQUE (agent_execution_id, step_index)
    );";

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL journal, normal sync
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

pub(crate) fn db_err(e: impl std::fmt::Display) -> FlowError {
    FlowError::Database(e.to_string())
}

/// Timestamps are stored as fixed-width RFC 3339 so text ordering matches
/// time ordering.
pub(crate) fn fmt_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn to_json_text(value: &serde_json::Value) -> String {
    value.to_string()
}

pub(crate) fn opt_json_text(value: &Option<serde_json::Value>) -> Option<String> {
    value.as_ref().map(to_json_text)
}

pub(crate) fn conversion_err(
    idx: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

pub(crate) fn json_col<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_err(idx, e))
}

pub(crate) fn opt_json_col(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<serde_json::Value>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| serde_json::from_str(&t).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

pub(crate) fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

pub(crate) fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        DateTime::parse_from_rfc3339(&t)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

pub(crate) fn status_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<ExecutionStatus> {
    let text: String = row.get(idx)?;
    text.parse::<ExecutionStatus>()
        .map_err(|e| conversion_err(idx, e))
}

pub(crate) fn opt_u64_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<u64>> {
    let value: Option<i64> = row.get(idx)?;
    Ok(value.map(|v| v as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("flowdeck.db");
        SqliteStore::open(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowdeck.db");
        drop(SqliteStore::open(&path).unwrap());
        SqliteStore::open(&path).unwrap();
    }

    #[test]
    fn test_time_format_sorts_lexicographically() {
        let early = DateTime::parse_from_rfc3339("2026-01-01T09:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2026-01-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(fmt_time(&early) < fmt_time(&late));
        assert_eq!(fmt_time(&late), "2026-01-01T10:00:00.000000Z");
    }
}
