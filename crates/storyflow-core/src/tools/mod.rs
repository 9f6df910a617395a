//! External quality tools and the test runner.
//!
//! These wrap subprocesses rather than the agent, but still run through the
//! SDK execution layer as scalar sources so their callers get the same
//! [`SdkResult`] shape, timeout handling and cleanup tracking as agent
//! calls. A binary missing from `PATH` gives a non-successful result, not
//! an error.

mod pyright;
mod pytest;
mod ruff;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::QualityToolKind;
use crate::sdk::{
    ExecuteOptions, MessageSource, SdkExecutor, SdkResult, SourceError, StreamMessage,
    TargetPredicate,
};

pub use pytest::{PytestRunner, TestCase, TestOutcome, TestReport, TestSummary};

// ---------------------------------------------------------------------------
// Issues
// ---------------------------------------------------------------------------

/// One finding reported by a linter or type checker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Path relative to the project root when possible.
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub code: Option<String>,
    pub severity: String,
    pub message: String,
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)?;
        if let Some(code) = &self.code {
            write!(f, " [{code}]")?;
        }
        write!(f, " {}: {}", self.severity, self.message)
    }
}

/// Output of one quality-tool run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolRun {
    pub tool: String,
    pub exit_code: Option<i32>,
    pub issues: Vec<Issue>,
}

impl StreamMessage for ToolRun {}

impl ToolRun {
    /// Issues grouped by file, files in sorted order.
    pub fn by_file(&self) -> BTreeMap<String, Vec<Issue>> {
        let mut grouped: BTreeMap<String, Vec<Issue>> = BTreeMap::new();
        for issue in &self.issues {
            grouped.entry(issue.file.clone()).or_default().push(issue.clone());
        }
        grouped
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait QualityTool: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> SdkResult<ToolRun>;
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_tests(&self) -> SdkResult<TestReport>;
}

// ---------------------------------------------------------------------------
// CommandTool
// ---------------------------------------------------------------------------

/// A linter or type checker invoked as `<program> <args> <target>` whose
/// stdout is JSON.
#[derive(Debug, Clone)]
pub struct CommandTool {
    kind: QualityToolKind,
    program: String,
    root: PathBuf,
    target: PathBuf,
    executor: SdkExecutor,
    timeout: Duration,
}

impl CommandTool {
    pub fn new(
        kind: QualityToolKind,
        root: &Path,
        target: &Path,
        executor: SdkExecutor,
        timeout: Duration,
    ) -> Self {
        Self {
            kind,
            program: kind.program().to_string(),
            root: root.to_path_buf(),
            target: target.to_path_buf(),
            executor,
            timeout,
        }
    }

    /// Use a different executable, e.g. a virtualenv copy.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = match self.kind {
            QualityToolKind::Ruff => vec!["check".into(), "--output-format".into(), "json".into()],
            QualityToolKind::Basedpyright => vec!["--outputjson".into()],
        };
        args.push(self.target.display().to_string());
        args
    }
}

#[async_trait]
impl QualityTool for CommandTool {
    fn name(&self) -> &str {
        self.kind.program()
    }

    async fn check(&self) -> SdkResult<ToolRun> {
        let kind = self.kind;
        let program = self.program.clone();
        let args = self.args();
        let root = self.root.clone();
        let source = MessageSource::scalar(async move {
            let out = run_command(&program, &args, &root).await?;
            // 0 is clean, 1 means findings; anything else is a crash.
            if !matches!(out.exit_code, Some(0 | 1)) {
                return Err(SourceError::other(format!(
                    "{program} exited abnormally (exit code {:?}): {}",
                    out.exit_code,
                    tail(&out.stderr, 400)
                )));
            }
            let issues = match kind {
                QualityToolKind::Ruff => ruff::parse(&out.stdout, &root),
                QualityToolKind::Basedpyright => pyright::parse(&out.stdout, &root),
            }
            .map_err(|e| {
                SourceError::other(format!(
                    "{program} output not understood ({e}); exit code {:?}; stderr: {}",
                    out.exit_code,
                    tail(&out.stderr, 400)
                ))
            })?;
            Ok(ToolRun {
                tool: kind.program().to_string(),
                exit_code: out.exit_code,
                issues,
            })
        });
        self.executor
            .execute(
                source,
                TargetPredicate::any(),
                ExecuteOptions::new(format!("tool:{}", self.name()), self.timeout),
            )
            .await
    }
}

// ---------------------------------------------------------------------------
// Subprocess plumbing
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Run `program` to completion. The exit code is returned, not judged:
/// callers decide which codes signal findings.
pub(crate) async fn run_command(
    program: &str,
    args: &[String],
    cwd: &Path,
) -> Result<CommandOutput, SourceError> {
    let exe = which::which(program)
        .map_err(|_| SourceError::other(format!("{program} not found on PATH")))?;
    tracing::debug!(program, ?args, cwd = %cwd.display(), "running tool");
    let output = tokio::process::Command::new(exe)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| SourceError::other(format!("{program} failed to start: {e}")))?;
    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Path relative to `root` when it lies inside it.
pub(crate) fn relative_file(file: &str, root: &Path) -> String {
    Path::new(file)
        .strip_prefix(root)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| file.to_string())
}

fn tail(text: &str, max: usize) -> &str {
    let text = text.trim_end();
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Write an executable shell script named `name` into `dir`.
#[cfg(all(test, unix))]
pub(crate) fn fake_program(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::SdkErrorKind;

    #[cfg(unix)]
    fn tool_with_script(kind: QualityToolKind, dir: &Path, body: &str) -> CommandTool {
        let program = fake_program(dir, kind.program(), body);
        CommandTool::new(
            kind,
            dir,
            Path::new("src"),
            SdkExecutor::default(),
            Duration::from_secs(10),
        )
        .with_program(program.display().to_string())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crashed_linter_is_a_failed_run() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = tool_with_script(
            QualityToolKind::Ruff,
            dir.path(),
            "echo 'ruff failed: invalid pyproject.toml' >&2\nexit 2",
        );
        let result = tool.check().await;
        assert!(!result.success());
        assert!(result.messages.is_empty());
        assert!(result.errors[0].contains("exit code Some(2)"));
        assert!(result.errors[0].contains("invalid pyproject.toml"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn findings_exit_code_is_accepted() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = tool_with_script(
            QualityToolKind::Ruff,
            dir.path(),
            r#"echo '[{"code": "F401", "filename": "src/a.py", "message": "unused", "location": {"row": 1, "column": 1}}]'
exit 1"#,
        );
        let result = tool.check().await;
        assert!(result.success());
        let run = result.into_target().unwrap();
        assert_eq!(run.exit_code, Some(1));
        assert_eq!(run.issues.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_type_checker_is_not_clean() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = tool_with_script(QualityToolKind::Basedpyright, dir.path(), "exit 0");
        let result = tool.check().await;
        assert!(!result.success());
        assert!(result.errors[0].contains("output not understood"));
    }

    #[tokio::test]
    async fn missing_binary_is_an_empty_failed_run() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = CommandTool::new(
            QualityToolKind::Ruff,
            dir.path(),
            Path::new("src"),
            SdkExecutor::default(),
            Duration::from_secs(5),
        )
        .with_program("storyflow-no-such-linter");
        let result = tool.check().await;
        assert!(!result.success());
        assert!(result.cleanup_completed);
        assert!(result.messages.is_empty());
        assert_eq!(result.error_kind, SdkErrorKind::Unknown);
        assert!(result.errors[0].contains("not found on PATH"));
    }

    #[test]
    fn ruff_args_request_json() {
        let tool = CommandTool::new(
            QualityToolKind::Ruff,
            Path::new("/p"),
            Path::new("src"),
            SdkExecutor::default(),
            Duration::from_secs(1),
        );
        assert_eq!(tool.args(), vec!["check", "--output-format", "json", "src"]);
    }

    #[test]
    fn issues_group_by_file() {
        let issue = |file: &str, line| Issue {
            file: file.into(),
            line,
            column: 1,
            code: None,
            severity: "error".into(),
            message: "m".into(),
        };
        let run = ToolRun {
            tool: "ruff".into(),
            exit_code: Some(1),
            issues: vec![issue("b.py", 1), issue("a.py", 2), issue("b.py", 3)],
        };
        let grouped = run.by_file();
        assert_eq!(grouped.keys().collect::<Vec<_>>(), vec!["a.py", "b.py"]);
        assert_eq!(grouped["b.py"].len(), 2);
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("ééééé", 3).chars().count(), 1);
    }
}
