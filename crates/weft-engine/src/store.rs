use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, params_from_iter, Connection};

use weft_core::error::{Result, WeftError};
use weft_core::traits::RunRecorder;
use weft_core::types::{Run, RunEvent, RunFilter, RunId};

/// Run records and event logs persisted in SQLite.
///
/// Each run is stored as a JSON document alongside the columns used for
/// filtering; events are appended per run and read back ordered by `seq`.
pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

impl SqliteRunStore {
    /// Open or create the store at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| WeftError::Database(e.to_string()))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| WeftError::Database(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS runs (
                 run_id TEXT PRIMARY KEY,
                 workflow_name TEXT NOT NULL,
                 status TEXT NOT NULL,
                 start_time TEXT NOT NULL,
                 end_time TEXT,
                 run_json TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_runs_workflow
                 ON runs(workflow_name, start_time DESC);

             CREATE TABLE IF NOT EXISTS run_events (
                 run_id TEXT NOT NULL,
                 seq INTEGER NOT NULL,
                 timestamp TEXT NOT NULL,
                 event_json TEXT NOT NULL,
                 PRIMARY KEY (run_id, seq)
             );",
        )
        .map_err(|e| WeftError::Database(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| WeftError::Database(e.to_string()))
    }

    fn insert_event(&self, event: &RunEvent) -> Result<()> {
        let json = serde_json::to_string(event)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO run_events (run_id, seq, timestamp, event_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event.run_id.0,
                event.seq as i64,
                timestamp(&event.timestamp),
                json
            ],
        )
        .map_err(|e| WeftError::Database(e.to_string()))?;
        Ok(())
    }

    fn upsert_run(&self, run: &Run) -> Result<()> {
        let json = serde_json::to_string(run)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO runs (run_id, workflow_name, status, start_time, end_time, run_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(run_id) DO UPDATE SET
                 status = excluded.status,
                 end_time = excluded.end_time,
                 run_json = excluded.run_json",
            params![
                run.run_id.0,
                run.workflow_name,
                run.status.as_str(),
                timestamp(&run.start_time),
                run.end_time.as_ref().map(timestamp),
                json
            ],
        )
        .map_err(|e| WeftError::Database(e.to_string()))?;
        Ok(())
    }

    fn select_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT run_json FROM runs WHERE run_id = ?1",
                params![run_id.0],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(WeftError::Database(other.to_string())),
            })?;
        json.map(|j| serde_json::from_str(&j).map_err(WeftError::from))
            .transpose()
    }

    fn select_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let mut sql = String::from("SELECT run_json FROM runs");
        let mut clauses = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(workflow) = &filter.workflow {
            args.push(workflow.clone());
            clauses.push(format!("workflow_name = ?{}", args.len()));
        }
        if let Some(status) = filter.status {
            args.push(status.as_str().to_string());
            clauses.push(format!("status = ?{}", args.len()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY start_time DESC, rowid DESC");
        match (filter.limit, filter.offset) {
            (Some(limit), offset) => {
                sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset.unwrap_or(0)))
            }
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
            (None, None) => {}
        }

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| WeftError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))
            .map_err(|e| WeftError::Database(e.to_string()))?;

        let mut runs = Vec::new();
        for row in rows {
            let json = row.map_err(|e| WeftError::Database(e.to_string()))?;
            runs.push(serde_json::from_str(&json)?);
        }
        Ok(runs)
    }

    fn select_events(&self, run_id: &RunId) -> Result<Vec<RunEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT event_json FROM run_events WHERE run_id = ?1 ORDER BY seq ASC")
            .map_err(|e| WeftError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![run_id.0], |row| row.get::<_, String>(0))
            .map_err(|e| WeftError::Database(e.to_string()))?;

        let mut events = Vec::new();
        for row in rows {
            let json = row.map_err(|e| WeftError::Database(e.to_string()))?;
            events.push(serde_json::from_str(&json)?);
        }
        Ok(events)
    }

    /// Delete a run and its events. Returns whether the run existed.
    pub fn delete_run(&self, run_id: &RunId) -> Result<bool> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM run_events WHERE run_id = ?1", params![run_id.0])
            .map_err(|e| WeftError::Database(e.to_string()))?;
        let deleted = conn
            .execute("DELETE FROM runs WHERE run_id = ?1", params![run_id.0])
            .map_err(|e| WeftError::Database(e.to_string()))?;
        Ok(deleted > 0)
    }

    pub fn count_runs(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))
            .map_err(|e| WeftError::Database(e.to_string()))?;
        Ok(count as usize)
    }
}

/// Fixed-width RFC 3339 so stored timestamps sort as text.
fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

impl RunRecorder for SqliteRunStore {
    fn record_event(&self, event: RunEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.insert_event(&event) })
    }

    fn save_run(&self, run: Run) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.upsert_run(&run) })
    }

    fn load_run(&self, run_id: RunId) -> BoxFuture<'_, Result<Option<Run>>> {
        Box::pin(async move { self.select_run(&run_id) })
    }

    fn list_runs(&self, filter: RunFilter) -> BoxFuture<'_, Result<Vec<Run>>> {
        Box::pin(async move { self.select_runs(&filter) })
    }

    fn load_events(&self, run_id: RunId) -> BoxFuture<'_, Result<Vec<RunEvent>>> {
        Box::pin(async move { self.select_events(&run_id) })
    }
}
