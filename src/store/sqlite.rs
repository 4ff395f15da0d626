use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use tracing::warn;

use super::{RunMutation, RunStateStore};
use crate::errors::StoreError;
use crate::models::{EngineParams, Run, RunState};

/// How long SQLite itself waits on a locked database before reporting busy.
const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_millis(50);

const RUN_COLUMNS: &str = "run_id, workflow_url, workflow_type, workflow_type_version, \
     params_blob, engine_params, state, last_updated, version";

/// Bounded retry with exponential backoff for `SQLITE_BUSY` / `SQLITE_LOCKED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyRetry {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for BusyRetry {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(200),
        }
    }
}

/// SQLite-backed run store.
///
/// The connection lives behind `Arc<Mutex>` and every statement runs on
/// tokio's blocking pool via `spawn_blocking`, keeping synchronous SQLite
/// I/O off the async workers. Version guards live in the `WHERE` clause, so
/// a lost race shows up as zero changed rows.
#[derive(Clone)]
pub struct SqliteRunStore {
    conn: Arc<Mutex<Connection>>,
    retry: BusyRetry,
}

impl SqliteRunStore {
    /// Open (or create) a store at the given path and run migrations.
    pub fn open(path: &Path, retry: BusyRetry) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        Self::init(conn, retry)
    }

    /// Create an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        Self::init(conn, BusyRetry::default())
    }

    fn init(conn: Connection, retry: BusyRetry) -> Result<Self> {
        conn.busy_timeout(SQLITE_BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                workflow_url TEXT NOT NULL,
                workflow_type TEXT NOT NULL,
                workflow_type_version TEXT NOT NULL,
                params_blob TEXT NOT NULL,
                engine_params TEXT NOT NULL DEFAULT '{}',
                state TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                version INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_runs_state ON runs(state);
            ",
        )
        .context("Failed to create runs table")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retry,
        })
    }

    /// Run `f` against the connection on a blocking thread, retrying busy
    /// errors with backoff. `f` may run more than once.
    async fn call<F, R>(&self, op: &'static str, f: F) -> Result<R, StoreError>
    where
        F: Fn(&Connection) -> rusqlite::Result<R> + Send + Sync + 'static,
        R: Send + 'static,
    {
        let f = Arc::new(f);
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 0;

        loop {
            let conn = Arc::clone(&self.conn);
            let f = Arc::clone(&f);
            let outcome = tokio::task::spawn_blocking(move || {
                let guard = conn
                    .lock()
                    .map_err(|e| anyhow::anyhow!("Run store lock poisoned: {}", e))?;
                Ok::<_, anyhow::Error>(f(&*guard))
            })
            .await
            .context("Run store task panicked")
            .and_then(|inner| inner)
            .map_err(StoreError::Unavailable)?;

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if is_busy(&e) && attempt < self.retry.max_retries => {
                    attempt += 1;
                    warn!(op, attempt, backoff_ms = backoff.as_millis() as u64, "run store busy, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.retry.max_backoff);
                }
                Err(e) => {
                    return Err(StoreError::Unavailable(
                        anyhow::Error::new(e).context(format!("Run store {} failed", op)),
                    ));
                }
            }
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let engine_params: String = row.get(5)?;
    let state: String = row.get(6)?;
    let last_updated: String = row.get(7)?;
    let version: i64 = row.get(8)?;
    Ok(Run {
        run_id: row.get(0)?,
        workflow_url: row.get(1)?,
        workflow_type: row.get(2)?,
        workflow_type_version: row.get(3)?,
        params_blob: row.get(4)?,
        engine_params: serde_json::from_str::<EngineParams>(&engine_params)
            .map_err(|e| conversion_error(5, e))?,
        state: state.parse::<RunState>().map_err(|e| conversion_error(6, e))?,
        last_updated: DateTime::parse_from_rfc3339(&last_updated)
            .map_err(|e| conversion_error(7, e))?
            .with_timezone(&Utc),
        version: version as u64,
    })
}

fn stored_version(conn: &Connection, run_id: &str) -> rusqlite::Result<Option<u64>> {
    conn.query_row(
        "SELECT version FROM runs WHERE run_id = ?1",
        params![run_id],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.map(|v| v as u64))
}

#[async_trait]
impl RunStateStore for SqliteRunStore {
    async fn get(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        let run_id = run_id.to_string();
        self.call("get", move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM runs WHERE run_id = ?1", RUN_COLUMNS),
                params![run_id],
                row_to_run,
            )
            .optional()
        })
        .await
    }

    async fn create(&self, mut run: Run) -> Result<Run, StoreError> {
        run.version = 1;
        let engine_params = serde_json::to_string(&run.engine_params)
            .map_err(|e| StoreError::Unavailable(anyhow::Error::new(e)))?;
        let row = run.clone();
        let inserted = self
            .call("create", move |conn| {
                conn.execute(
                    &format!(
                        "INSERT OR IGNORE INTO runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        RUN_COLUMNS
                    ),
                    params![
                        row.run_id,
                        row.workflow_url,
                        row.workflow_type,
                        row.workflow_type_version,
                        row.params_blob,
                        engine_params,
                        row.state.as_str(),
                        row.last_updated.to_rfc3339(),
                        row.version as i64,
                    ],
                )
            })
            .await?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists { run_id: run.run_id });
        }
        Ok(run)
    }

    async fn compare_and_update(
        &self,
        run_id: &str,
        expected_version: u64,
        mutate: RunMutation,
    ) -> Result<Run, StoreError> {
        let conflict = |found| StoreError::Conflict {
            run_id: run_id.to_string(),
            expected: expected_version,
            found,
        };

        let current = self.get(run_id).await?.ok_or_else(|| conflict(None))?;
        if current.version != expected_version {
            return Err(conflict(Some(current.version)));
        }

        let mut draft = current;
        mutate(&mut draft);
        draft.version = expected_version + 1;

        let key = run_id.to_string();
        let state = draft.state.as_str();
        let last_updated = draft.last_updated.to_rfc3339();
        let (changed, found) = self
            .call("compare_and_update", move |conn| {
                let changed = conn.execute(
                    "UPDATE runs SET state = ?1, last_updated = ?2, version = version + 1
                     WHERE run_id = ?3 AND version = ?4",
                    params![state, last_updated, key, expected_version as i64],
                )?;
                let found = if changed == 0 {
                    stored_version(conn, &key)?
                } else {
                    None
                };
                Ok((changed, found))
            })
            .await?;

        if changed == 0 {
            return Err(conflict(found));
        }
        Ok(draft)
    }

    async fn delete_if_version(
        &self,
        run_id: &str,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let key = run_id.to_string();
        let (changed, found) = self
            .call("delete_if_version", move |conn| {
                let changed = conn.execute(
                    "DELETE FROM runs WHERE run_id = ?1 AND version = ?2",
                    params![key, expected_version as i64],
                )?;
                let found = if changed == 0 {
                    stored_version(conn, &key)?
                } else {
                    None
                };
                Ok((changed, found))
            })
            .await?;

        if changed == 0 {
            return Err(StoreError::Conflict {
                run_id: run_id.to_string(),
                expected: expected_version,
                found,
            });
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.call("count", |conn| {
            conn.query_row("SELECT COUNT(*) FROM runs", [], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
        })
        .await
    }
}
