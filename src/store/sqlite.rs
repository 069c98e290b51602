// src/store/sqlite.rs

//! SQLite-backed [`OperationStore`].
//!
//! Tables:
//! - `pipelines`: one row per pipeline name and its stored algorithm
//! - `operations`: one row per queued operation
//! - `operation_holds`: one row per (operation, context) hold
//! - `meta`: the last committed snapshot number

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::{debug, info};
use uuid::Uuid;

use super::{OperationStore, PersistedOperation, PipelineChangeset, PipelineRecord};
use crate::commit::RowWrite;
use crate::errors::{CloudpipeError, Result};
use crate::operation::Operation;
use crate::types::{OperationStatus, PipelineAlgorithm};

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 1;

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and bring its schema up to
    /// date.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        info!(path = %path.display(), "opened operation store");
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )?;

        let current: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        if current < 1 {
            self.conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS pipelines (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    algorithm INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS operations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL UNIQUE,
                    pipeline_id INTEGER NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
                    snapshot INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    priority INTEGER NOT NULL,
                    dependencies TEXT NOT NULL,
                    payload BLOB NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_operations_pipeline
                    ON operations(pipeline_id, snapshot, id);

                CREATE TABLE IF NOT EXISTS operation_holds (
                    uuid TEXT NOT NULL,
                    context TEXT NOT NULL,
                    hold_until TEXT NOT NULL,
                    PRIMARY KEY (uuid, context)
                );

                CREATE TABLE IF NOT EXISTS meta (
                    key TEXT PRIMARY KEY,
                    value INTEGER NOT NULL
                );
                ",
            )?;
            self.conn.execute(
                "INSERT INTO schema_migrations (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
            debug!(version = SCHEMA_VERSION, "applied schema migration");
        }

        Ok(())
    }
}

impl OperationStore for SqliteStore {
    fn lookup_pipeline(
        &self,
        name: &str,
        previous_names: &BTreeSet<String>,
    ) -> Result<Option<PipelineRecord>> {
        let candidates = std::iter::once(name).chain(previous_names.iter().map(String::as_str));
        for candidate in candidates {
            if let Some((rowid, stored)) = find_pipeline(&self.conn, candidate)? {
                return Ok(Some(PipelineRecord {
                    rowid,
                    name: candidate.to_string(),
                    previous_algorithm: Some(stored),
                }));
            }
        }
        Ok(None)
    }

    fn register_pipeline(
        &mut self,
        name: &str,
        previous_names: &BTreeSet<String>,
        algorithm: PipelineAlgorithm,
    ) -> Result<PipelineRecord> {
        let tx = self.conn.transaction()?;

        let mut found = find_pipeline(&tx, name)?;
        if found.is_none() {
            for previous in previous_names {
                if let Some((rowid, stored)) = find_pipeline(&tx, previous)? {
                    tx.execute(
                        "UPDATE pipelines SET name = ?1 WHERE id = ?2",
                        params![name, rowid],
                    )?;
                    info!(pipeline = name, previous, "renamed stored pipeline");
                    found = Some((rowid, stored));
                    break;
                }
            }
        }

        let record = match found {
            Some((rowid, stored)) => PipelineRecord {
                rowid,
                name: name.to_string(),
                previous_algorithm: Some(stored),
            },
            None => {
                tx.execute(
                    "INSERT INTO pipelines (name, algorithm) VALUES (?1, ?2)",
                    params![name, algorithm.as_code()],
                )?;
                PipelineRecord {
                    rowid: tx.last_insert_rowid(),
                    name: name.to_string(),
                    previous_algorithm: None,
                }
            }
        };

        tx.commit()?;
        Ok(record)
    }

    fn set_pipeline_algorithm(&mut self, pipeline_rowid: i64, algorithm: PipelineAlgorithm) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE pipelines SET algorithm = ?1 WHERE id = ?2",
            params![algorithm.as_code(), pipeline_rowid],
        )?;
        if updated == 0 {
            return Err(CloudpipeError::PipelineNotFound(format!("rowid {pipeline_rowid}")));
        }
        Ok(())
    }

    fn last_snapshot(&self) -> Result<u64> {
        let value: Option<i64> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'last_snapshot'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map(|v| v.max(0) as u64).unwrap_or(0))
    }

    fn apply_changesets(
        &mut self,
        snapshot: u64,
        changesets: &[PipelineChangeset],
    ) -> Result<HashMap<Uuid, i64>> {
        let tx = self.conn.transaction()?;
        let mut assigned = HashMap::new();

        for changes in changesets {
            for write in changes.changeset.writes() {
                apply_write(&tx, changes.pipeline_rowid, write, &mut assigned)?;
            }
        }

        tx.execute(
            "INSERT INTO meta (key, value) VALUES ('last_snapshot', ?1)
             ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)",
            params![snapshot as i64],
        )?;

        tx.commit()?;
        debug!(snapshot, inserted = assigned.len(), "storage commit written");
        Ok(assigned)
    }

    fn save_holds(&mut self, uuid: Uuid, holds: &BTreeMap<String, DateTime<Utc>>) -> Result<()> {
        let tx = self.conn.transaction()?;
        let key = uuid.to_string();
        tx.execute("DELETE FROM operation_holds WHERE uuid = ?1", params![key])?;
        for (context, date) in holds {
            tx.execute(
                "INSERT INTO operation_holds (uuid, context, hold_until) VALUES (?1, ?2, ?3)",
                params![key, context, format_date(date)],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_operations(&self, pipeline_rowid: i64) -> Result<Vec<PersistedOperation>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, uuid, snapshot, status, priority, dependencies, payload
             FROM operations
             WHERE pipeline_id = ?1
             ORDER BY snapshot ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![pipeline_rowid], |row| {
            Ok(OperationRow {
                rowid: row.get(0)?,
                uuid: row.get(1)?,
                snapshot: row.get(2)?,
                status: row.get(3)?,
                priority: row.get(4)?,
                dependencies: row.get(5)?,
                payload: row.get(6)?,
            })
        })?;

        let mut holds_stmt = self
            .conn
            .prepare("SELECT context, hold_until FROM operation_holds WHERE uuid = ?1")?;

        let mut loaded = Vec::new();
        for row in rows {
            let row = row?;
            let held: Vec<(String, String)> = holds_stmt
                .query_map(params![row.uuid], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;

            let mut holds = BTreeMap::new();
            for (context, date) in held {
                holds.insert(context, parse_date(&date)?);
            }

            loaded.push(PersistedOperation {
                operation: row.into_operation()?,
                holds,
            });
        }
        Ok(loaded)
    }
}

fn find_pipeline(conn: &Connection, name: &str) -> Result<Option<(i64, PipelineAlgorithm)>> {
    let found: Option<(i64, i64)> = conn
        .query_row(
            "SELECT id, algorithm FROM pipelines WHERE name = ?1",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    found
        .map(|(rowid, code)| {
            PipelineAlgorithm::from_code(code)
                .map(|algorithm| (rowid, algorithm))
                .ok_or_else(|| {
                    CloudpipeError::CorruptRow(format!("pipeline '{name}' has unknown algorithm code {code}"))
                })
        })
        .transpose()
}

fn apply_write(
    tx: &Transaction<'_>,
    pipeline_rowid: i64,
    write: &RowWrite,
    assigned: &mut HashMap<Uuid, i64>,
) -> Result<()> {
    match write {
        RowWrite::Insert(op) => {
            tx.execute(
                "INSERT INTO operations
                    (uuid, pipeline_id, snapshot, status, priority, dependencies, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    op.uuid().to_string(),
                    pipeline_rowid,
                    op.snapshot() as i64,
                    status_to_str(op.status()),
                    op.priority(),
                    serde_json::to_string(op.dependencies())?,
                    op.payload(),
                ],
            )?;
            assigned.insert(op.uuid(), tx.last_insert_rowid());
        }
        RowWrite::Modify(op) => {
            tx.execute(
                "UPDATE operations
                 SET priority = ?2, dependencies = ?3, payload = ?4
                 WHERE uuid = ?1",
                params![
                    op.uuid().to_string(),
                    op.priority(),
                    serde_json::to_string(op.dependencies())?,
                    op.payload(),
                ],
            )?;
        }
        RowWrite::Status { uuid, status } => {
            tx.execute(
                "UPDATE operations SET status = ?2 WHERE uuid = ?1",
                params![uuid.to_string(), status_to_str(*status)],
            )?;
        }
        RowWrite::Delete { uuid } => {
            let key = uuid.to_string();
            tx.execute("DELETE FROM operations WHERE uuid = ?1", params![key])?;
            tx.execute("DELETE FROM operation_holds WHERE uuid = ?1", params![key])?;
        }
    }
    Ok(())
}

struct OperationRow {
    rowid: i64,
    uuid: String,
    snapshot: i64,
    status: String,
    priority: i32,
    dependencies: String,
    payload: Vec<u8>,
}

impl OperationRow {
    fn into_operation(self) -> Result<Operation> {
        let uuid = parse_uuid(&self.uuid)?;
        let status = status_from_str(&self.status)
            .ok_or_else(|| CloudpipeError::CorruptRow(format!("operation {uuid} has status '{}'", self.status)))?;
        let dependencies: Vec<Uuid> = serde_json::from_str(&self.dependencies)?;

        let mut op = Operation::with_uuid(uuid);
        op.set_rowid(self.rowid);
        op.set_snapshot(self.snapshot.max(0) as u64);
        op.set_status(status);
        op.set_priority(self.priority);
        op.set_dependencies(dependencies);
        op.set_payload(self.payload);
        Ok(op)
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| CloudpipeError::CorruptRow(format!("invalid uuid '{s}': {e}")))
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_date(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| CloudpipeError::CorruptRow(format!("invalid hold date '{s}': {e}")))
}

fn status_to_str(status: OperationStatus) -> &'static str {
    match status {
        OperationStatus::Pending => "pending",
        OperationStatus::Active => "active",
        OperationStatus::Completed => "completed",
        OperationStatus::Skipped => "skipped",
    }
}

fn status_from_str(s: &str) -> Option<OperationStatus> {
    match s {
        "pending" => Some(OperationStatus::Pending),
        "active" => Some(OperationStatus::Active),
        "completed" => Some(OperationStatus::Completed),
        "skipped" => Some(OperationStatus::Skipped),
        _ => None,
    }
}
