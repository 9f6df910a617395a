//! `pytest --json-report` runner and report model.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{run_command, tail, TestRunner};
use crate::sdk::{
    ExecuteOptions, MessageSource, SdkExecutor, SdkResult, SourceError, StreamMessage,
    TargetPredicate,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
    Error,
    Skipped,
    /// xfailed, xpassed and anything newer plugins report.
    #[serde(other)]
    Other,
}

impl TestOutcome {
    pub fn is_failure(self) -> bool {
        matches!(self, TestOutcome::Failed | TestOutcome::Error)
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TestOutcome::Passed => "passed",
            TestOutcome::Failed => "failed",
            TestOutcome::Error => "error",
            TestOutcome::Skipped => "skipped",
            TestOutcome::Other => "other",
        })
    }
}

/// setup / call / teardown section of one test.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestPhase {
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub longrepr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub nodeid: String,
    pub outcome: TestOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longrepr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<TestPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<TestPhase>,
}

impl TestCase {
    /// Failure text: the top-level `longrepr`, else the call phase's, else
    /// the setup phase's.
    pub fn detail(&self) -> Option<&str> {
        self.longrepr
            .as_deref()
            .or_else(|| self.call.as_ref().and_then(|p| p.longrepr.as_deref()))
            .or_else(|| self.setup.as_ref().and_then(|p| p.longrepr.as_deref()))
            .filter(|s| !s.trim().is_empty())
    }

    /// Test file part of the node id.
    pub fn file(&self) -> &str {
        self.nodeid.split("::").next().unwrap_or(&self.nodeid)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    #[serde(default)]
    pub passed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub error: u32,
    #[serde(default)]
    pub skipped: u32,
    #[serde(default)]
    pub total: u32,
}

/// pytest exit status for "no tests collected".
const EXIT_NO_TESTS: i32 = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestReport {
    /// pytest's exit status; absent in reports from older plugin versions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exitcode: Option<i32>,
    #[serde(default)]
    pub summary: TestSummary,
    /// Collection results. A module that fails to import shows up here as a
    /// failed collector keyed by its file, with no entry in `tests`.
    #[serde(default)]
    pub collectors: Vec<TestCase>,
    #[serde(default)]
    pub tests: Vec<TestCase>,
}

impl StreamMessage for TestReport {}

impl TestReport {
    pub fn parse(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Failed collectors first, then failed or errored tests.
    pub fn failures(&self) -> Vec<&TestCase> {
        self.collectors
            .iter()
            .filter(|c| !c.nodeid.is_empty())
            .chain(&self.tests)
            .filter(|t| t.outcome.is_failure())
            .collect()
    }

    /// The run finished cleanly: exit status 0 (or "no tests collected")
    /// and nothing failed.
    pub fn exited_cleanly(&self) -> bool {
        matches!(self.exitcode, None | Some(0) | Some(EXIT_NO_TESTS))
    }

    pub fn all_green(&self) -> bool {
        self.exited_cleanly()
            && self.summary.failed == 0
            && self.summary.error == 0
            && self.failures().is_empty()
    }
}

// ---------------------------------------------------------------------------
// PytestRunner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PytestRunner {
    program: String,
    root: PathBuf,
    test_dir: PathBuf,
    executor: SdkExecutor,
    timeout: Duration,
}

impl PytestRunner {
    pub fn new(root: &Path, test_dir: &Path, executor: SdkExecutor, timeout: Duration) -> Self {
        Self {
            program: "pytest".to_string(),
            root: root.to_path_buf(),
            test_dir: test_dir.to_path_buf(),
            executor,
            timeout,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

#[async_trait]
impl TestRunner for PytestRunner {
    async fn run_tests(&self) -> SdkResult<TestReport> {
        let program = self.program.clone();
        let root = self.root.clone();
        let test_dir = self.test_dir.display().to_string();
        let source = MessageSource::scalar(async move {
            let report_file = tempfile::Builder::new()
                .prefix("storyflow-pytest-")
                .suffix(".json")
                .tempfile()
                .map_err(|e| SourceError::other(format!("cannot create report file: {e}")))?;
            let args = vec![
                "--json-report".to_string(),
                format!("--json-report-file={}", report_file.path().display()),
                "-q".to_string(),
                test_dir,
            ];
            let out = run_command(&program, &args, &root).await?;
            let raw = tokio::fs::read_to_string(report_file.path())
                .await
                .unwrap_or_default();
            if raw.trim().is_empty() {
                return Err(SourceError::other(format!(
                    "{program} wrote no JSON report (exit code {:?}); is pytest-json-report \
                     installed? stderr: {}",
                    out.exit_code,
                    tail(&out.stderr, 400)
                )));
            }
            TestReport::parse(&raw)
                .map_err(|e| SourceError::other(format!("{program} report not understood: {e}")))
        });
        self.executor
            .execute(
                source,
                TargetPredicate::any(),
                ExecuteOptions::new("tool:pytest", self.timeout),
            )
            .await
    }
}
