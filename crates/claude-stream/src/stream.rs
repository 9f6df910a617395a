use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::process::CliProcess;
use crate::types::{Message, QueryOptions};
use crate::Result;

const CHANNEL_DEPTH: usize = 64;

// ─── QueryStream ──────────────────────────────────────────────────────────

/// Async stream of [`Message`]s from one CLI subprocess.
///
/// A background task owns the [`CliProcess`] and forwards records over an
/// mpsc channel until the terminal `result` record, end of output, or a
/// failed send (receiver dropped). The subprocess is killed when the task
/// exits, so dropping the stream is enough to release it.
pub struct QueryStream {
    rx: mpsc::Receiver<Result<Message>>,
}

impl QueryStream {
    pub(crate) fn spawn(prompt: String, opts: QueryOptions) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        tokio::spawn(async move {
            match CliProcess::start(&prompt, &opts).await {
                Ok(process) => pump(process, tx).await,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                }
            }
        });
        QueryStream { rx }
    }

    /// Wrap a raw receiver, for tests that feed fixed record sequences.
    #[cfg(test)]
    pub(crate) fn from_channel(rx: mpsc::Receiver<Result<Message>>) -> Self {
        Self { rx }
    }
}

/// Forward records from `process` into `tx`. Stops after the first result
/// record. A process that exits without one has its exit status checked and
/// any failure forwarded as the final item.
pub(crate) async fn pump(mut process: CliProcess, tx: mpsc::Sender<Result<Message>>) {
    let mut saw_result = false;
    loop {
        match process.next_message().await {
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
            Ok(None) => break,
            Ok(Some(msg)) => {
                let terminal = matches!(msg, Message::Result(_));
                saw_result |= terminal;
                if tx.send(Ok(msg)).await.is_err() || terminal {
                    break;
                }
            }
        }
    }

    if !saw_result {
        if let Some(err) = process.exit_error().await {
            let _ = tx.send(Err(err)).await;
        }
    }
    process.kill().await;
}

impl Stream for QueryStream {
    type Item = Result<Message>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio::process::Command;

    /// Serve `lines` through `cat` so the real line reader is exercised.
    fn cat_stream(lines: &[&str]) -> (QueryStream, NamedTempFile) {
        let mut f = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        let mut cmd = Command::new("cat");
        cmd.arg(f.path());
        let process = CliProcess::from_command(cmd).unwrap();
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        tokio::spawn(pump(process, tx));
        (QueryStream::from_channel(rx), f)
    }

    const INIT: &str = r#"{"type":"system","subtype":"init","session_id":"s1","model":"m","cwd":"/tmp"}"#;
    const ASSISTANT: &str = r#"{"type":"assistant","session_id":"s1","message":{"content":[{"type":"text","text":"working"}]}}"#;
    const RESULT: &str = r#"{"type":"result","subtype":"success","session_id":"s1","is_error":false,"result":"done","num_turns":2}"#;
    const RATE_LIMIT: &str = r#"{"type":"rate_limit_event","session_id":"s1"}"#;

    #[tokio::test]
    async fn yields_every_record_up_to_result() {
        let (stream, _f) = cat_stream(&[INIT, ASSISTANT, RESULT]);
        let messages: Vec<_> = stream.collect().await;
        assert_eq!(messages.len(), 3);
        let last = messages.last().unwrap().as_ref().unwrap();
        assert_eq!(last.as_result().unwrap().text(), Some("done"));
    }

    #[tokio::test]
    async fn stops_after_result_record() {
        let (stream, _f) = cat_stream(&[INIT, RESULT, ASSISTANT]);
        let messages: Vec<_> = stream.collect().await;
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn unknown_record_types_become_other() {
        let (stream, _f) = cat_stream(&[INIT, RATE_LIMIT, RESULT]);
        let messages: Vec<_> = stream.collect().await;
        assert_eq!(messages.len(), 3);
        assert!(matches!(messages[1].as_ref().unwrap(), Message::Other));
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let (stream, _f) = cat_stream(&[INIT, "", "   ", RESULT]);
        let messages: Vec<_> = stream.collect().await;
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn garbage_line_surfaces_parse_error() {
        let (stream, _f) = cat_stream(&[INIT, "not json at all"]);
        let messages: Vec<_> = stream.collect().await;
        assert!(messages[0].is_ok());
        assert!(matches!(
            messages[1],
            Err(crate::StreamError::Parse { .. })
        ));
    }
}
