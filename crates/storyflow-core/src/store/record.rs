use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::status::ProcessingStatus;

pub(crate) const COLUMNS: &str = "id, epic_id, story_path, status, phase, iteration, qa_result, \
                                  error, created_at, updated_at, version";

/// One row of the `stories` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryRecord {
    pub id: i64,
    pub epic_id: String,
    pub story_path: String,
    pub status: ProcessingStatus,
    pub phase: Option<String>,
    pub iteration: u32,
    pub qa_result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub version: i64,
}

impl StoryRecord {
    /// Decode a row selected with [`COLUMNS`]. Unknown statuses and
    /// unparseable QA payloads are read leniently.
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(3)?;
        let qa_raw: Option<String> = row.get(6)?;
        let iteration: i64 = row.get(5)?;
        Ok(Self {
            id: row.get(0)?,
            epic_id: row.get(1)?,
            story_path: row.get(2)?,
            status: ProcessingStatus::from_db(&status),
            phase: row.get(4)?,
            iteration: u32::try_from(iteration).unwrap_or(0),
            qa_result: qa_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
            error: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            version: row.get(10)?,
        })
    }
}

/// Result of a write that may lose an optimistic-concurrency race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateOutcome {
    Applied { version: i64 },
    /// The stored version did not match the expected one; nothing changed.
    Conflict { current_version: i64 },
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied { .. })
    }

    /// The version now stored for the story.
    pub fn version(&self) -> i64 {
        match *self {
            UpdateOutcome::Applied { version } => version,
            UpdateOutcome::Conflict { current_version } => current_version,
        }
    }
}

/// Optional fields of an `update_status` call.
#[derive(Debug, Clone, Default)]
pub struct UpdateParams {
    /// Epic the story belongs to. Required.
    pub epic_id: String,
    pub phase: Option<String>,
    pub iteration: Option<u32>,
    pub qa_result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub expected_version: Option<i64>,
    /// Timestamp to record as `updated_at`; now when unset.
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    /// Overrides the store-wide lock timeout for this call.
    pub lock_timeout: Option<std::time::Duration>,
}

impl UpdateParams {
    pub fn for_epic(epic_id: impl Into<String>) -> Self {
        Self {
            epic_id: epic_id.into(),
            ..Self::default()
        }
    }

    pub fn phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn expected_version(mut self, version: i64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Extra fields a controller may attach to a processing-status update.
#[derive(Debug, Clone, Default)]
pub struct StatusMetadata {
    pub phase: Option<String>,
    pub iteration: Option<u32>,
    pub qa_result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Counts reported by `initialize_for_epic`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InitReport {
    pub removed_existing: usize,
    pub removed_transient: usize,
}

/// Snapshot returned by `health`.
#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub path: String,
    pub exists: bool,
    pub lock_held: bool,
    pub lock_timeout_secs: u64,
    pub pool_size: usize,
    pub pool_idle: usize,
    pub records: i64,
    pub journal_mode: String,
}
