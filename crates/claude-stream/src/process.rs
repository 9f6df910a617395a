use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};

use crate::types::{Message, PermissionMode, QueryOptions};
use crate::{Result, StreamError};

const DEFAULT_EXECUTABLE: &str = "claude";

// ─── CliProcess ───────────────────────────────────────────────────────────

/// A running `claude --print --output-format stream-json` subprocess.
///
/// The prompt is written to stdin as one user record and stdin is then
/// closed. Records are read line by line from stdout. Stderr is drained
/// into a buffer by a background task and attached to exit errors.
pub(crate) struct CliProcess {
    child: Child,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr: Arc<Mutex<String>>,
}

impl CliProcess {
    pub(crate) async fn start(prompt: &str, opts: &QueryOptions) -> Result<Self> {
        let exe = opts
            .path_to_executable
            .clone()
            .unwrap_or_else(|| DEFAULT_EXECUTABLE.to_string());
        let mut cmd = command_for(&exe, opts);
        // Nested sessions refuse to start when this marker is inherited.
        cmd.env_remove("CLAUDECODE");
        cmd.envs(&opts.env);

        let mut process = Self::launch(cmd).map_err(|e| match e {
            StreamError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                StreamError::ExecutableNotFound(exe.clone())
            }
            other => other,
        })?;
        process.write_prompt(prompt).await?;
        Ok(process)
    }

    /// Run an arbitrary command as the record source. Tests use `cat` on a
    /// fixture file.
    #[cfg(test)]
    pub(crate) fn from_command(cmd: Command) -> Result<Self> {
        Self::launch(cmd)
    }

    fn launch(mut cmd: Command) -> Result<Self> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StreamError::Process("stdout was not captured".into()))?;

        let stderr = Arc::new(Mutex::new(String::new()));
        if let Some(pipe) = child.stderr.take() {
            let sink = Arc::clone(&stderr);
            tokio::spawn(async move {
                let mut lines = BufReader::new(pipe).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Ok(mut buf) = sink.lock() {
                        if !buf.is_empty() {
                            buf.push('\n');
                        }
                        buf.push_str(&line);
                    }
                }
            });
        }

        Ok(Self {
            child,
            stdout: BufReader::new(stdout).lines(),
            stderr,
        })
    }

    async fn write_prompt(&mut self, prompt: &str) -> Result<()> {
        let record = serde_json::json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{ "type": "text", "text": prompt }]
            }
        });
        let mut line = serde_json::to_vec(&record)
            .map_err(|e| StreamError::Process(format!("cannot encode prompt: {e}")))?;
        line.push(b'\n');

        // Taking stdin drops it at the end of this scope, which closes the
        // pipe and tells the CLI no further turns follow.
        let mut stdin = self
            .child
            .stdin
            .take()
            .ok_or_else(|| StreamError::Process("stdin was not captured".into()))?;
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Next record from stdout, or `Ok(None)` at end of stream. Blank lines
    /// are skipped.
    pub(crate) async fn next_message(&mut self) -> Result<Option<Message>> {
        while let Some(line) = self.stdout.next_line().await? {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str::<Message>(trimmed)
                .map(Some)
                .map_err(|source| StreamError::Parse {
                    line: trimmed.to_owned(),
                    source,
                });
        }
        Ok(None)
    }

    /// Reap the child. Returns an error describing a non-zero exit, with
    /// whatever stderr was captured.
    pub(crate) async fn exit_error(&mut self) -> Option<StreamError> {
        let status = match self.child.wait().await {
            Ok(s) => s,
            Err(e) => return Some(StreamError::Io(e)),
        };
        if status.success() {
            return None;
        }
        let stderr = self
            .stderr
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default();
        let what = match status.code() {
            Some(code) => format!("claude exited with code {code}"),
            None => "claude was terminated by a signal".to_string(),
        };
        Some(StreamError::Process(if stderr.is_empty() {
            what
        } else {
            format!("{what}\nstderr: {stderr}")
        }))
    }

    pub(crate) async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "claude subprocess already gone");
        }
    }
}

// ─── Command builder ──────────────────────────────────────────────────────

fn command_for(exe: &str, opts: &QueryOptions) -> Command {
    let mut cmd = Command::new(exe);
    cmd.args([
        "--print",
        "--verbose",
        "--output-format",
        "stream-json",
        "--input-format",
        "stream-json",
    ]);

    if let Some(model) = &opts.model {
        cmd.arg("--model").arg(model);
    }
    if let Some(turns) = opts.max_turns {
        cmd.arg("--max-turns").arg(turns.to_string());
    }
    if opts.permission_mode != PermissionMode::Default {
        cmd.arg("--permission-mode")
            .arg(opts.permission_mode.as_str());
    }
    if !opts.allowed_tools.is_empty() {
        cmd.arg("--allowed-tools").args(&opts.allowed_tools);
    }
    if let Some(sp) = &opts.system_prompt {
        cmd.arg("--system-prompt").arg(sp);
    }
    if let Some(extra) = &opts.append_system_prompt {
        cmd.arg("--append-system-prompt").arg(extra);
    }
    if let Some(dir) = &opts.cwd {
        cmd.current_dir(dir);
    }
    cmd
}
