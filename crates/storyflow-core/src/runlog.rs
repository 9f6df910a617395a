use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::Result;

const RULE: &str = "======================================================================";

/// Event names written to the run log.
pub mod events {
    pub const EPIC_START: &str = "epic_start";
    pub const EPIC_DONE: &str = "epic_done";
    pub const EPIC_ERROR: &str = "epic_error";
    pub const STORY_START: &str = "story_start";
    pub const STORY_DONE: &str = "story_done";
    pub const STORY_FAILED: &str = "story_failed";
    pub const STORY_ERROR: &str = "story_error";
    pub const STORY_RETRY: &str = "story_retry";
    pub const ROUND: &str = "round";
    pub const PHASE: &str = "phase";
    pub const BUDGET_EXHAUSTED: &str = "budget_exhausted";
    pub const SYNC: &str = "status_sync";
    pub const QUALITY: &str = "quality";
    pub const TESTS: &str = "tests";
    pub const DEBUG_INSTRUCTIONS: &str = "debug_instructions";
    pub const CANCELLED: &str = "cancelled";
}

/// Append-only log of one workflow run, framed by a header and a footer.
/// Every record is flushed as it is written.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    started: DateTime<Utc>,
    file: Mutex<File>,
}

impl RunLog {
    /// Create `storyflow-<YYYYmmdd-HHMMSS>.log` in `dir` and write the
    /// header.
    pub fn create(dir: &Path, title: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let started = Utc::now();
        let stamp = started.format("%Y%m%d-%H%M%S").to_string();
        let mut path = dir.join(format!("storyflow-{stamp}.log"));
        let mut n = 1;
        while path.exists() {
            path = dir.join(format!("storyflow-{stamp}-{n}.log"));
            n += 1;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let log = Self {
            path,
            started,
            file: Mutex::new(file),
        };
        log.write_raw(&format!(
            "{RULE}\nstoryflow run started {}\n{title}\n{RULE}\n",
            started.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped record.
    pub fn record(&self, event: &str, message: impl AsRef<str>) {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let message = message.as_ref().replace('\n', "\n    ");
        self.write_raw(&format!("{now} [{event}] {message}\n"));
    }

    /// Write the footer. Records written afterwards still land in the file.
    pub fn finish(&self, outcome: &str) {
        let ended = Utc::now();
        let secs = (ended - self.started).num_milliseconds() as f64 / 1000.0;
        self.write_raw(&format!(
            "{RULE}\nstoryflow run finished {} ({outcome}, {secs:.1}s)\n{RULE}\n",
            ended.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
    }

    fn write_raw(&self, text: &str) {
        let mut file = self.file.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = file.write_all(text.as_bytes()).and_then(|_| file.flush()) {
            tracing::warn!(path = %self.path.display(), error = %e, "run log write failed");
        }
    }
}
