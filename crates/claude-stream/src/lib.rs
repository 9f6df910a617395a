//! `claude-stream` drives the Claude CLI in `--output-format stream-json`
//! mode and exposes the output as an async stream of typed messages.
//!
//! # Architecture
//!
//! ```text
//! QueryOptions
//!     │
//!     ▼
//! CliProcess      ← spawns `claude --print --output-format stream-json …`
//!     │              prompt on stdin, JSONL on stdout, stderr captured
//!     ▼
//! QueryStream     ← futures::Stream<Item = Result<Message>>
//!     │              background task + mpsc channel
//!     ▼
//! Message         ← system / assistant / user / result; anything else is `Other`
//! ```
//!
//! Only three message categories matter to callers: the stream of records
//! itself, the terminal `result` record, and the options that select the
//! permission mode, working directory and CLI path.

pub mod error;
pub mod types;

pub(crate) mod process;
pub mod stream;

#[cfg(test)]
mod tests;

pub use error::StreamError;
pub use stream::QueryStream;
pub use types::{
    AssistantBody, AssistantMessage, ContentBlock, Message, PermissionMode, QueryOptions,
    ResultMessage, SystemMessage, UserMessage,
};

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Start one streaming query against the Claude CLI.
///
/// The returned stream ends after the first [`Message::Result`] or when the
/// subprocess exits. Dropping it stops the background reader and kills the
/// subprocess.
///
/// ```rust,ignore
/// use claude_stream::{query, Message, QueryOptions};
/// use futures::StreamExt;
///
/// let mut stream = query("say hello", QueryOptions::default());
/// while let Some(msg) = stream.next().await {
///     if let Message::Result(r) = msg? {
///         println!("{}", r.text().unwrap_or(""));
///     }
/// }
/// ```
pub fn query(prompt: impl Into<String>, opts: QueryOptions) -> QueryStream {
    QueryStream::spawn(prompt.into(), opts)
}
