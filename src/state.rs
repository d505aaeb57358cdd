//! SQLite-backed persistence of runs, task instances and attempts
//!
//! A run is keyed by its run id (`"{pipeline}@{logical ts}"`), which makes
//! the `(pipeline, logical timestamp)` pair unique. Everything needed to
//! resume an interrupted run is stored: per-task state, attempt count, last
//! error, the external step handle, and the attempt history.

use crate::error::{PipewrightError, Result};
use crate::models::{
    AttemptRecord, AttemptRow, ExternalStepHandle, Run, RunHandle, RunRecord, RunStatus,
    TaskInstance,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Per-pipeline summary for `status`
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub name: String,
    pub total_runs: usize,
    pub last_status: Option<RunStatus>,
    pub last_logical_ts: Option<DateTime<Utc>>,
}

/// State store shared by the run manager and the CLI
#[derive(Clone)]
pub struct StateManager {
    conn: Arc<Mutex<Connection>>,
}

impl StateManager {
    /// Open (or create) the database at `db_path`
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -2000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        let manager = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        manager.init_schema()?;
        Ok(manager)
    }

    /// In-memory database, used by tests and `run --no-state`
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let manager = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        manager.init_schema()?;
        Ok(manager)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipewrightError::Other("state database lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS pipelines (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY,
                run_id TEXT NOT NULL UNIQUE,
                pipeline_id INTEGER NOT NULL,
                logical_ts TIMESTAMP NOT NULL,
                status TEXT NOT NULL,
                started_at TIMESTAMP NOT NULL,
                completed_at TIMESTAMP,
                UNIQUE (pipeline_id, logical_ts),
                FOREIGN KEY (pipeline_id) REFERENCES pipelines(id)
            );

            CREATE TABLE IF NOT EXISTS task_instances (
                run_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                external_handle TEXT,
                updated_at TIMESTAMP NOT NULL,
                PRIMARY KEY (run_id, task_id),
                FOREIGN KEY (run_id) REFERENCES runs(run_id)
            );

            CREATE TABLE IF NOT EXISTS task_attempts (
                id INTEGER PRIMARY KEY,
                run_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                error TEXT,
                started_at TIMESTAMP NOT NULL,
                finished_at TIMESTAMP NOT NULL,
                UNIQUE (run_id, task_id, attempt),
                FOREIGN KEY (run_id) REFERENCES runs(run_id)
            );

            CREATE INDEX IF NOT EXISTS idx_runs_pipeline_ts ON runs(pipeline_id, logical_ts DESC);
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            CREATE INDEX IF NOT EXISTS idx_task_attempts_run ON task_attempts(run_id);
            ",
        )?;

        Ok(())
    }

    /// Get or create pipeline ID
    pub fn get_or_create_pipeline(&self, name: &str) -> Result<i64> {
        let conn = self.conn()?;
        pipeline_id(&conn, name)
    }

    /// Persist a whole run: run row, every instance and every attempt record
    pub fn save_run(&self, run: &Run) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let run_id = upsert_run(&tx, &run.handle, run.status)?;
        for instance in run.instances.values() {
            upsert_instance(&tx, &run_id, instance)?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Persist one instance after a dispatch completes
    pub fn save_instance(&self, handle: &RunHandle, instance: &TaskInstance) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        upsert_instance(&tx, &handle.run_id(), instance)?;
        tx.commit()?;
        Ok(())
    }

    /// Update the status of an existing run
    pub fn update_run_status(&self, handle: &RunHandle, status: RunStatus) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE runs SET status = ?1, completed_at = ?2 WHERE run_id = ?3",
            params![
                status.to_string(),
                if status.is_terminal() {
                    Some(Utc::now())
                } else {
                    None
                },
                handle.run_id()
            ],
        )?;

        if updated == 0 {
            return Err(PipewrightError::RunNotFound(handle.run_id()));
        }
        Ok(())
    }

    /// Load a persisted run with its instances and attempt history
    pub fn load_run(&self, handle: &RunHandle) -> Result<Option<Run>> {
        let conn = self.conn()?;
        let run_id = handle.run_id();

        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        let status: RunStatus = match status {
            Some(s) => s.parse()?,
            None => return Ok(None),
        };

        let mut history: HashMap<String, Vec<AttemptRecord>> = HashMap::new();
        for row in query_attempts(&conn, &run_id)? {
            history.entry(row.task_id).or_default().push(row.record);
        }

        let mut stmt = conn.prepare(
            "SELECT task_id, state, attempts, last_error, external_handle
             FROM task_instances WHERE run_id = ?1",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut instances = HashMap::new();
        for row in rows {
            let (task_id, state, attempts, last_error, external) = row?;
            let external = match external {
                Some(json) => Some(serde_json::from_str::<ExternalStepHandle>(&json)?),
                None => None,
            };
            let instance = TaskInstance {
                state: state.parse()?,
                attempts,
                last_error,
                external,
                history: history.remove(&task_id).unwrap_or_default(),
                task_id: task_id.clone(),
            };
            instances.insert(task_id, instance);
        }

        Ok(Some(Run {
            handle: handle.clone(),
            status,
            instances,
        }))
    }

    /// Latest run of `pipeline` with a logical timestamp before `logical_ts`
    pub fn previous_run(&self, pipeline: &str, logical_ts: DateTime<Utc>) -> Result<Option<RunRecord>> {
        let conn = self.conn()?;
        let mut records = query_runs(
            &conn,
            "WHERE p.name = ?1 AND r.logical_ts < ?2 ORDER BY r.logical_ts DESC LIMIT 1",
            params![pipeline, logical_ts],
        )?;
        Ok(records.pop())
    }

    /// Run history for a pipeline, newest logical timestamp first
    pub fn get_run_history(&self, pipeline: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.conn()?;
        query_runs(
            &conn,
            "WHERE p.name = ?1 ORDER BY r.logical_ts DESC LIMIT ?2",
            params![pipeline, limit],
        )
    }

    /// Runs left queued or running by a previous process
    pub fn interrupted_runs(&self, pipeline: &str) -> Result<Vec<RunRecord>> {
        let conn = self.conn()?;
        query_runs(
            &conn,
            "WHERE p.name = ?1 AND r.status IN ('queued', 'running') ORDER BY r.logical_ts",
            params![pipeline],
        )
    }

    /// Attempt records of a run, in execution order
    pub fn get_attempts(&self, run_id: &str) -> Result<Vec<AttemptRow>> {
        let conn = self.conn()?;
        query_attempts(&conn, run_id)
    }

    /// One summary row per known pipeline
    pub fn list_pipelines(&self) -> Result<Vec<PipelineSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT p.name,
                    (SELECT COUNT(*) FROM runs r WHERE r.pipeline_id = p.id),
                    (SELECT r.status FROM runs r WHERE r.pipeline_id = p.id
                        ORDER BY r.logical_ts DESC LIMIT 1),
                    (SELECT MAX(r.logical_ts) FROM runs r WHERE r.pipeline_id = p.id)
             FROM pipelines p ORDER BY p.name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<DateTime<Utc>>>(3)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (name, total_runs, last_status, last_logical_ts) = row?;
            summaries.push(PipelineSummary {
                name,
                total_runs: total_runs as usize,
                last_status: last_status.map(|s| s.parse()).transpose()?,
                last_logical_ts,
            });
        }
        Ok(summaries)
    }
}

fn pipeline_id(conn: &Connection, name: &str) -> Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM pipelines WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(id) = existing {
        return Ok(id);
    }

    conn.execute("INSERT INTO pipelines (name) VALUES (?1)", params![name])?;
    Ok(conn.last_insert_rowid())
}

fn upsert_run(conn: &Connection, handle: &RunHandle, status: RunStatus) -> Result<String> {
    let pipeline = pipeline_id(conn, &handle.graph_id)?;
    let run_id = handle.run_id();
    let completed_at = if status.is_terminal() {
        Some(Utc::now())
    } else {
        None
    };

    conn.execute(
        "INSERT INTO runs (run_id, pipeline_id, logical_ts, status, started_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(run_id) DO UPDATE SET
            status = excluded.status,
            completed_at = excluded.completed_at",
        params![
            run_id,
            pipeline,
            handle.logical_ts,
            status.to_string(),
            Utc::now(),
            completed_at
        ],
    )?;

    Ok(run_id)
}

fn upsert_instance(conn: &Connection, run_id: &str, instance: &TaskInstance) -> Result<()> {
    let external = instance
        .external
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO task_instances (run_id, task_id, state, attempts, last_error, external_handle, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(run_id, task_id) DO UPDATE SET
            state = excluded.state,
            attempts = excluded.attempts,
            last_error = excluded.last_error,
            external_handle = excluded.external_handle,
            updated_at = excluded.updated_at",
        params![
            run_id,
            instance.task_id,
            instance.state.to_string(),
            instance.attempts,
            instance.last_error,
            external,
            Utc::now()
        ],
    )?;

    // Attempt numbers never repeat within a run, so earlier records are skipped.
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO task_attempts (run_id, task_id, attempt, outcome, error, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for record in &instance.history {
        stmt.execute(params![
            run_id,
            instance.task_id,
            record.attempt,
            record.outcome.to_string(),
            record.error,
            record.started_at,
            record.finished_at
        ])?;
    }

    Ok(())
}

fn query_runs(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<RunRecord>> {
    let sql = format!(
        "SELECT r.run_id, p.name, r.logical_ts, r.status, r.started_at, r.completed_at
         FROM runs r JOIN pipelines p ON r.pipeline_id = p.id {}",
        filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, DateTime<Utc>>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, DateTime<Utc>>(4)?,
            row.get::<_, Option<DateTime<Utc>>>(5)?,
        ))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (run_id, pipeline, logical_ts, status, started_at, completed_at) = row?;
        records.push(RunRecord {
            run_id,
            pipeline,
            logical_ts,
            status: status.parse()?,
            started_at,
            completed_at,
        });
    }
    Ok(records)
}

fn query_attempts(conn: &Connection, run_id: &str) -> Result<Vec<AttemptRow>> {
    let mut stmt = conn.prepare(
        "SELECT task_id, attempt, outcome, error, started_at, finished_at
         FROM task_attempts WHERE run_id = ?1 ORDER BY started_at, id",
    )?;
    let rows = stmt.query_map(params![run_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, u32>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, DateTime<Utc>>(4)?,
            row.get::<_, DateTime<Utc>>(5)?,
        ))
    })?;

    let mut attempts = Vec::new();
    for row in rows {
        let (task_id, attempt, outcome, error, started_at, finished_at) = row?;
        attempts.push(AttemptRow {
            task_id,
            record: AttemptRecord {
                attempt,
                outcome: outcome.parse()?,
                error,
                started_at,
                finished_at,
            },
        });
    }
    Ok(attempts)
}
