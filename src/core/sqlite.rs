//! SQLite-backed run store.
//!
//! Uses rusqlite with WAL mode. All statements run via
//! `tokio::task::spawn_blocking` so the async runtime is never blocked.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde_json::Value;
use tracing::info;

use super::store::{RunStore, StoreError};
use crate::domain::{Event, EventKind, Run, RunFilter, RunKind, RunStatus};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS runs (
        run_id          TEXT PRIMARY KEY,
        kind            TEXT NOT NULL,
        status          TEXT NOT NULL DEFAULT 'pending',
        request_payload TEXT NOT NULL,
        request_digest  TEXT NOT NULL,
        decision        TEXT,
        result          TEXT,
        error           TEXT,
        timestamps      TEXT NOT NULL DEFAULT '{}',
        created_at      TEXT NOT NULL,
        completed_at    TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at DESC);
    CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);

    CREATE TABLE IF NOT EXISTS events (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id      TEXT NOT NULL,
        seq         INTEGER NOT NULL,
        type        TEXT NOT NULL,
        step        TEXT NOT NULL,
        agent       TEXT,
        ts          TEXT NOT NULL,
        elapsed_ms  INTEGER NOT NULL,
        payload     TEXT NOT NULL,
        UNIQUE(run_id, seq)
    );
    CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id);
";

const RUN_COLUMNS: &str = "run_id, kind, status, request_payload, request_digest, decision, \
                           result, error, timestamps, created_at, completed_at";

/// Thread-safe handle to the SQLite database
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database at the given path
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.with_conn(|conn| Ok(conn.execute_batch(SCHEMA)?))?;

        info!(path = %path.display(), "SQLite run store opened");
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.with_conn(|conn| Ok(conn.execute_batch(SCHEMA)?))?;
        Ok(store)
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    async fn with_conn_async<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| StoreError::Database(format!("Task join error: {}", e)))?
    }
}

fn ts(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(format!("Bad timestamp '{}': {}", raw, e)))
}

/// Raw `runs` row, converted outside the rusqlite closure
struct RunRow {
    run_id: String,
    kind: String,
    status: String,
    request_payload: String,
    request_digest: String,
    decision: Option<String>,
    result: Option<String>,
    error: Option<String>,
    timestamps: String,
    created_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            kind: row.get(1)?,
            status: row.get(2)?,
            request_payload: row.get(3)?,
            request_digest: row.get(4)?,
            decision: row.get(5)?,
            result: row.get(6)?,
            error: row.get(7)?,
            timestamps: row.get(8)?,
            created_at: row.get(9)?,
            completed_at: row.get(10)?,
        })
    }

    fn into_run(self) -> Result<Run, StoreError> {
        Ok(Run {
            id: self.run_id,
            kind: self.kind.parse::<RunKind>().map_err(StoreError::Database)?,
            status: self.status.parse::<RunStatus>().map_err(StoreError::Database)?,
            request: serde_json::from_str(&self.request_payload)?,
            request_digest: self.request_digest,
            decision: self.decision,
            result: self
                .result
                .as_deref()
                .map(serde_json::from_str::<Value>)
                .transpose()?,
            error: self.error,
            timestamps: serde_json::from_str(&self.timestamps)?,
            created_at: parse_ts(&self.created_at)?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

/// Raw `events` row
struct EventRow {
    run_id: String,
    seq: i64,
    kind: String,
    step: String,
    agent: Option<String>,
    ts: String,
    elapsed_ms: i64,
    payload: String,
}

impl EventRow {
    fn into_event(self) -> Result<Event, StoreError> {
        let kind: EventKind = serde_json::from_value(Value::String(self.kind))?;
        Ok(Event {
            run_id: self.run_id,
            seq: self.seq as u64,
            kind,
            step: self.step,
            agent: self.agent,
            ts: parse_ts(&self.ts)?,
            elapsed_ms: self.elapsed_ms as u64,
            payload: serde_json::from_str(&self.payload)?,
        })
    }
}

fn run_exists(conn: &Connection, run_id: &str) -> Result<bool, StoreError> {
    Ok(conn
        .query_row("SELECT 1 FROM runs WHERE run_id = ?1", params![run_id], |_| Ok(()))
        .optional()?
        .is_some())
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        let run = run.clone();
        let request = serde_json::to_string(&run.request)?;
        let timestamps = serde_json::to_string(&run.timestamps)?;

        self.with_conn_async(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO runs (run_id, kind, status, request_payload, request_digest, timestamps, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run.id,
                    run.kind.as_str(),
                    run.status.as_str(),
                    request,
                    run.request_digest,
                    timestamps,
                    ts(&run.created_at),
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::DuplicateRun(run.id));
            }
            Ok(())
        })
        .await
    }

    async fn update_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let run_id = run_id.to_string();
        let error = error.map(str::to_string);
        let completed_at = status.is_terminal().then(|| ts(&Utc::now()));

        self.with_conn_async(move |conn| {
            let changed = conn.execute(
                "UPDATE runs
                 SET status = ?2,
                     error = COALESCE(?3, error),
                     completed_at = COALESCE(?4, completed_at)
                 WHERE run_id = ?1 AND status NOT IN ('completed', 'failed')",
                params![run_id, status.as_str(), error, completed_at],
            )?;
            if changed == 0 && !run_exists(conn, &run_id)? {
                return Err(StoreError::RunNotFound(run_id));
            }
            Ok(changed > 0)
        })
        .await
    }

    async fn save_decision(
        &self,
        run_id: &str,
        decision: &str,
        result: &Value,
        timestamps: &BTreeMap<String, DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let run_id = run_id.to_string();
        let decision = decision.to_string();
        let result = serde_json::to_string(result)?;
        let timestamps = serde_json::to_string(timestamps)?;
        let completed_at = ts(&Utc::now());

        self.with_conn_async(move |conn| {
            let changed = conn.execute(
                "UPDATE runs
                 SET status = 'completed', decision = ?2, result = ?3, timestamps = ?4, completed_at = ?5
                 WHERE run_id = ?1 AND status NOT IN ('completed', 'failed')",
                params![run_id, decision, result, timestamps, completed_at],
            )?;
            if changed == 0 && !run_exists(conn, &run_id)? {
                return Err(StoreError::RunNotFound(run_id));
            }
            Ok(changed > 0)
        })
        .await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        let run_id = run_id.to_string();
        let row = self
            .with_conn_async(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {} FROM runs WHERE run_id = ?1", RUN_COLUMNS),
                        params![run_id],
                        RunRow::read,
                    )
                    .optional()?)
            })
            .await?;

        row.map(RunRow::into_run).transpose()
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError> {
        let status = filter.status.map(|s| s.as_str().to_string());
        let kind = filter.kind.map(|k| k.as_str().to_string());
        let limit = filter.limit as i64;
        let offset = filter.offset as i64;

        let rows = self
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM runs
                     WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR kind = ?2)
                     ORDER BY created_at DESC
                     LIMIT ?3 OFFSET ?4",
                    RUN_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![status, kind, limit, offset], RunRow::read)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(RunRow::into_run).collect()
    }

    async fn save_event(&self, event: &Event) -> Result<(), StoreError> {
        let event = event.clone();
        let payload = serde_json::to_string(&event.payload)?;

        self.with_conn_async(move |conn| {
            let result = conn.execute(
                "INSERT INTO events (run_id, seq, type, step, agent, ts, elapsed_ms, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    event.run_id,
                    event.seq as i64,
                    event.kind.as_str(),
                    event.step,
                    event.agent,
                    ts(&event.ts),
                    event.elapsed_ms as i64,
                    payload,
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::DuplicateEvent {
                        run_id: event.run_id,
                        seq: event.seq,
                    })
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn events_since(&self, run_id: &str, since: u64) -> Result<Vec<Event>, StoreError> {
        let run_id = run_id.to_string();
        let rows = self
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT run_id, seq, type, step, agent, ts, elapsed_ms, payload
                     FROM events WHERE run_id = ?1 AND seq > ?2 ORDER BY seq",
                )?;
                let rows = stmt
                    .query_map(params![run_id, since as i64], |row| {
                        Ok(EventRow {
                            run_id: row.get(0)?,
                            seq: row.get(1)?,
                            kind: row.get(2)?,
                            step: row.get(3)?,
                            agent: row.get(4)?,
                            ts: row.get(5)?,
                            elapsed_ms: row.get(6)?,
                            payload: row.get(7)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    async fn next_seq(&self, run_id: &str) -> Result<u64, StoreError> {
        let run_id = run_id.to_string();
        self.with_conn_async(move |conn| {
            let max: Option<i64> = conn.query_row(
                "SELECT MAX(seq) FROM events WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )?;
            Ok(max.map_or(1, |m| m as u64 + 1))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventBody;
    use serde_json::json;

    #[tokio::test]
    async fn test_run_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = Run::new(RunKind::Compliance, json!({ "beneficiary_name": "ACME", "amount": 5.0 }));
        store.create_run(&run).await.unwrap();

        let loaded = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.status, RunStatus::Pending);
        assert_eq!(loaded.request, run.request);
        assert_eq!(loaded.request_digest, run.request_digest);
        assert!(matches!(
            store.create_run(&run).await,
            Err(StoreError::DuplicateRun(_))
        ));
    }

    #[tokio::test]
    async fn test_event_uniqueness() {
        let store = SqliteStore::open_in_memory().unwrap();
        let body = EventBody::step_started("go");
        let event = Event {
            run_id: "r".to_string(),
            seq: 1,
            kind: body.kind(),
            step: "intake".to_string(),
            agent: None,
            ts: Utc::now(),
            elapsed_ms: 3,
            payload: body.into_payload(),
        };

        store.save_event(&event).await.unwrap();
        assert!(matches!(
            store.save_event(&event).await,
            Err(StoreError::DuplicateEvent { seq: 1, .. })
        ));

        let events = store.get_events("r").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, json!({ "message": "go" }));
        assert_eq!(store.next_seq("r").await.unwrap(), 2);
    }
}
