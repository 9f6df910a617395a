//! Persistent per-story state.
//!
//! The `stories` table is the single source of truth for processing status.
//! The store never touches story documents; the status synchronizer derives
//! document text from these records.
//!
//! Every operation, reads included, runs under one process-wide async
//! mutex whose acquisition is bounded by the configured lock timeout. The
//! SQLite work itself happens on the blocking pool with the mutex guard
//! moved into the closure, so a caller that gives up cannot let a second
//! writer in while the first is still running.

mod pool;
mod record;
mod schema;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::StoreConfig;
use crate::error::{FlowError, Result};
use crate::status::ProcessingStatus;

use pool::Pool;
pub use record::{
    InitReport, StatusMetadata, StoreHealth, StoryRecord, UpdateOutcome, UpdateParams,
};
use record::COLUMNS;

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    pool: Arc<Pool>,
    lock: Arc<Mutex<()>>,
    lock_timeout: Duration,
    transient_markers: Arc<Vec<String>>,
}

impl StateStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let pool = Pool::open(&path, config.pool_size)?;
        tracing::debug!(path = %path.display(), pool = config.pool_size, "state store opened");
        Ok(Self {
            path,
            pool: Arc::new(pool),
            lock: Arc::new(Mutex::new(())),
            lock_timeout: config.lock_timeout(),
            transient_markers: Arc::new(config.transient_markers.clone()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn acquire(&self, op: &str, timeout: Option<Duration>) -> Result<OwnedMutexGuard<()>> {
        let timeout = timeout.unwrap_or(self.lock_timeout);
        match tokio::time::timeout(timeout, Arc::clone(&self.lock).lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                tracing::error!(op, ?timeout, "state store lock timed out; possible deadlock");
                Err(FlowError::LockTimeout(timeout))
            }
        }
    }

    async fn run<T, F>(&self, op: &'static str, timeout: Option<Duration>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let held = self.acquire(op, timeout).await?;
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || {
            let _held = held;
            pool.with(f)
        })
        .await
        .map_err(|e| FlowError::TaskJoin(e.to_string()))?
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Insert or update the record for `story_path`.
    ///
    /// With `expected_version` set, the write only happens if the stored
    /// version matches (a missing record has version 0); otherwise nothing
    /// changes and [`UpdateOutcome::Conflict`] carries the stored version.
    /// Iteration never decreases.
    pub async fn update_status(
        &self,
        story_path: &str,
        status: ProcessingStatus,
        params: UpdateParams,
    ) -> Result<UpdateOutcome> {
        if params.epic_id.trim().is_empty() {
            return Err(FlowError::InvalidArgument(format!(
                "epic id is required to update '{story_path}'"
            )));
        }
        if story_path.trim().is_empty() {
            return Err(FlowError::InvalidArgument("story path is empty".into()));
        }
        let story_path = story_path.to_string();
        let timeout = params.lock_timeout;
        let outcome = self
            .run("update_status", timeout, move |conn| {
                write_status(conn, &story_path, status, &params)
            })
            .await?;
        if let UpdateOutcome::Conflict { current_version } = outcome {
            tracing::debug!(current_version, "optimistic update lost");
        }
        Ok(outcome)
    }

    /// Controller entry point. Only `in_progress`, `review` and `completed`
    /// are accepted here.
    pub async fn update_processing_status(
        &self,
        story_id: &str,
        status: ProcessingStatus,
        timestamp: Option<DateTime<Utc>>,
        epic_id: &str,
        metadata: StatusMetadata,
    ) -> Result<UpdateOutcome> {
        if !ProcessingStatus::controller_writable().contains(&status) {
            return Err(FlowError::InvalidArgument(format!(
                "status '{status}' cannot be set by a controller"
            )));
        }
        if epic_id.trim().is_empty() {
            return Err(FlowError::InvalidArgument(format!(
                "epic id is required to update '{story_id}'"
            )));
        }
        let params = UpdateParams {
            epic_id: epic_id.to_string(),
            phase: metadata.phase,
            iteration: metadata.iteration,
            qa_result: metadata.qa_result,
            error: metadata.error,
            expected_version: None,
            timestamp,
            lock_timeout: None,
        };
        self.update_status(story_id, status, params).await
    }

    /// Clear state left over from earlier runs of this epic's stories, plus
    /// any record whose path looks like a test or temp artifact.
    pub async fn initialize_for_epic(&self, epic_id: &str, story_ids: &[String]) -> Result<InitReport> {
        if epic_id.trim().is_empty() {
            return Err(FlowError::InvalidArgument("epic id is empty".into()));
        }
        let story_ids = story_ids.to_vec();
        let markers = Arc::clone(&self.transient_markers);
        let report = self
            .run("initialize_for_epic", None, move |conn| {
                let tx = conn.transaction()?;
                let mut report = InitReport::default();
                for id in &story_ids {
                    report.removed_existing +=
                        tx.execute("DELETE FROM stories WHERE story_path = ?1", params![id])?;
                }
                for marker in markers.iter().filter(|m| !m.is_empty()) {
                    report.removed_transient += tx.execute(
                        "DELETE FROM stories WHERE instr(story_path, ?1) > 0",
                        params![marker],
                    )?;
                }
                tx.commit()?;
                Ok(report)
            })
            .await?;
        tracing::info!(
            epic = epic_id,
            removed_existing = report.removed_existing,
            removed_transient = report.removed_transient,
            "state store initialized for epic"
        );
        Ok(report)
    }

    /// Delete records in a terminal status last updated more than `days`
    /// days ago.
    pub async fn cleanup_old_records(&self, days: u32) -> Result<usize> {
        let cutoff = timestamp(Utc::now() - chrono::Duration::days(i64::from(days)));
        let removed = self
            .run("cleanup_old_records", None, move |conn| {
                Ok(conn.execute(
                    "DELETE FROM stories
                     WHERE status IN ('completed', 'cancelled', 'error') AND updated_at < ?1",
                    params![cutoff],
                )?)
            })
            .await?;
        tracing::info!(days, removed, "old story records cleaned up");
        Ok(removed)
    }

    /// Copy the database file next to itself after checkpointing the WAL.
    pub async fn create_backup(&self) -> Result<PathBuf> {
        let src = self.path.clone();
        let name = format!(
            "{}.backup-{}",
            src.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "stories.db".to_string()),
            Utc::now().format("%Y%m%d-%H%M%S%3f")
        );
        let dest = src.with_file_name(name);
        let target = dest.clone();
        self.run("create_backup", None, move |conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
            std::fs::copy(&src, &target)?;
            Ok(())
        })
        .await?;
        tracing::info!(backup = %dest.display(), "state store backed up");
        Ok(dest)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get_status(&self, story_path: &str) -> Result<Option<StoryRecord>> {
        let story_path = story_path.to_string();
        self.run("get_status", None, move |conn| select_one(conn, &story_path))
            .await
    }

    pub async fn get_all_stories(&self) -> Result<Vec<StoryRecord>> {
        self.run("get_all_stories", None, |conn| {
            select_many(conn, &format!("SELECT {COLUMNS} FROM stories ORDER BY id"), params![])
        })
        .await
    }

    pub async fn get_stories_by_status(&self, status: ProcessingStatus) -> Result<Vec<StoryRecord>> {
        self.run("get_stories_by_status", None, move |conn| {
            select_many(
                conn,
                &format!("SELECT {COLUMNS} FROM stories WHERE status = ?1 ORDER BY id"),
                params![status.as_str()],
            )
        })
        .await
    }

    /// Records of `epic_id` for the given story paths, in the order asked.
    /// Paths without a record are skipped.
    pub async fn get_stories_by_ids(
        &self,
        epic_id: &str,
        story_paths: &[String],
    ) -> Result<Vec<StoryRecord>> {
        let epic_id = epic_id.to_string();
        let story_paths = story_paths.to_vec();
        self.run("get_stories_by_ids", None, move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM stories WHERE epic_id = ?1 AND story_path = ?2"
            ))?;
            let mut out = Vec::new();
            for path in &story_paths {
                if let Some(record) = stmt
                    .query_row(params![epic_id, path], StoryRecord::from_row)
                    .optional()?
                {
                    out.push(record);
                }
            }
            Ok(out)
        })
        .await
    }

    pub async fn health(&self) -> Result<StoreHealth> {
        let lock_held = self.lock.try_lock().is_err();
        let path = self.path.clone();
        let lock_timeout_secs = self.lock_timeout.as_secs();
        let pool = Arc::clone(&self.pool);
        let (records, journal_mode) = self
            .run("health", None, |conn| {
                let records: i64 = conn.query_row("SELECT COUNT(*) FROM stories", [], |r| r.get(0))?;
                let mode: String = conn.query_row("PRAGMA journal_mode", [], |r| r.get(0))?;
                Ok((records, mode))
            })
            .await?;
        Ok(StoreHealth {
            exists: path.exists(),
            path: path.display().to_string(),
            lock_held,
            lock_timeout_secs,
            pool_size: pool.size(),
            pool_idle: pool.idle_count(),
            records,
            journal_mode,
        })
    }
}

// ---------------------------------------------------------------------------
// SQL helpers
// ---------------------------------------------------------------------------

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn select_one(conn: &Connection, story_path: &str) -> Result<Option<StoryRecord>> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM stories WHERE story_path = ?1"),
            params![story_path],
            StoryRecord::from_row,
        )
        .optional()?)
}

fn select_many<P: rusqlite::Params>(conn: &Connection, sql: &str, p: P) -> Result<Vec<StoryRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(p, StoryRecord::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn write_status(
    conn: &mut Connection,
    story_path: &str,
    status: ProcessingStatus,
    p: &UpdateParams,
) -> Result<UpdateOutcome> {
    let tx = conn.transaction()?;
    let current: Option<(i64, i64)> = tx
        .query_row(
            "SELECT version, iteration FROM stories WHERE story_path = ?1",
            params![story_path],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    if let Some(expected) = p.expected_version {
        let stored = current.map_or(0, |(v, _)| v);
        if stored != expected {
            return Ok(UpdateOutcome::Conflict {
                current_version: stored,
            });
        }
    }

    let now = timestamp(p.timestamp.unwrap_or_else(Utc::now));
    let qa_result = p
        .qa_result
        .as_ref()
        .and_then(|v| serde_json::to_string(v).ok());

    let version = match current {
        None => {
            tx.execute(
                "INSERT INTO stories
                     (epic_id, story_path, status, phase, iteration, qa_result, error,
                      created_at, updated_at, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 1)",
                params![
                    p.epic_id,
                    story_path,
                    status.as_str(),
                    p.phase,
                    i64::from(p.iteration.unwrap_or(0)),
                    qa_result,
                    p.error,
                    now,
                ],
            )?;
            1
        }
        Some((version, iteration)) => {
            let iteration = iteration.max(i64::from(p.iteration.unwrap_or(0)));
            tx.execute(
                "UPDATE stories SET
                     epic_id = ?1,
                     status = ?2,
                     phase = COALESCE(?3, phase),
                     iteration = ?4,
                     qa_result = COALESCE(?5, qa_result),
                     error = COALESCE(?6, error),
                     updated_at = MAX(created_at, ?7),
                     version = version + 1
                 WHERE story_path = ?8",
                params![
                    p.epic_id,
                    status.as_str(),
                    p.phase,
                    iteration,
                    qa_result,
                    p.error,
                    now,
                    story_path,
                ],
            )?;
            version + 1
        }
    };
    tx.commit()?;
    Ok(UpdateOutcome::Applied { version })
}

/// Normalize a QA payload before persistence. Values that fail to
/// serialize are stored as null; null members are dropped.
pub fn normalize_qa_result<T: Serialize + ?Sized>(value: &T) -> Option<serde_json::Value> {
    match serde_json::to_value(value) {
        Ok(v) => strip_nulls(v),
        Err(e) => {
            tracing::warn!(error = %e, "qa result not serializable, storing null");
            None
        }
    }
}

fn strip_nulls(value: serde_json::Value) -> Option<serde_json::Value> {
    use serde_json::Value;
    match value {
        Value::Null => None,
        Value::Object(map) => Some(Value::Object(
            map.into_iter()
                .filter_map(|(k, v)| strip_nulls(v).map(|v| (k, v)))
                .collect(),
        )),
        Value::Array(items) => Some(Value::Array(
            items.into_iter().filter_map(strip_nulls).collect(),
        )),
        other => Some(other),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
