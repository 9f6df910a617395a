use std::fmt;
use std::sync::Arc;

use claude_stream::StreamError;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};

// ---------------------------------------------------------------------------
// SourceError
// ---------------------------------------------------------------------------

/// Failure raised by a message source while it is being driven.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Transport or protocol failure of the underlying agent client.
    #[error(transparent)]
    Transport(#[from] StreamError),

    /// The source tried to cancel or exit a scope it does not own.
    #[error("cancel scope violation: {0}")]
    ScopeViolation(String),

    #[error("source panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(String),
}

impl SourceError {
    pub fn other(msg: impl fmt::Display) -> Self {
        Self::Other(msg.to_string())
    }
}

// ---------------------------------------------------------------------------
// StreamMessage
// ---------------------------------------------------------------------------

/// A message a source can yield. The executor only needs the session id.
pub trait StreamMessage: Send + 'static {
    fn session_id(&self) -> Option<&str> {
        None
    }
}

impl StreamMessage for claude_stream::Message {
    fn session_id(&self) -> Option<&str> {
        claude_stream::Message::session_id(self)
    }
}

impl StreamMessage for String {}

impl StreamMessage for serde_json::Value {
    fn session_id(&self) -> Option<&str> {
        self.get("session_id").and_then(|v| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// MessageSource
// ---------------------------------------------------------------------------

pub type StreamFactory<M> =
    Box<dyn FnOnce() -> BoxStream<'static, Result<M, SourceError>> + Send + 'static>;

/// What the executor drives: either a lazy stream of messages, or a single
/// awaitable that yields one value.
///
/// The stream variant is a factory so nothing starts until the executor has
/// set up the call's scope.
pub enum MessageSource<M> {
    Stream(StreamFactory<M>),
    Scalar(BoxFuture<'static, Result<M, SourceError>>),
}

impl<M: StreamMessage> MessageSource<M> {
    pub fn stream<F, S>(factory: F) -> Self
    where
        F: FnOnce() -> S + Send + 'static,
        S: futures::Stream<Item = Result<M, SourceError>> + Send + 'static,
    {
        Self::Stream(Box::new(move || factory().boxed()))
    }

    pub fn scalar<F>(fut: F) -> Self
    where
        F: std::future::Future<Output = Result<M, SourceError>> + Send + 'static,
    {
        Self::Scalar(fut.boxed())
    }

    /// A stream source backed by a fixed list of items. Mostly for tests and
    /// dry runs.
    pub fn from_items(items: Vec<Result<M, SourceError>>) -> Self {
        Self::stream(move || futures::stream::iter(items))
    }
}

impl MessageSource<claude_stream::Message> {
    /// Wrap a claude CLI query.
    pub fn claude(prompt: String, opts: claude_stream::QueryOptions) -> Self {
        Self::stream(move || {
            claude_stream::query(prompt, opts).map(|item| item.map_err(SourceError::from))
        })
    }
}

impl<M> fmt::Debug for MessageSource<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream(_) => f.write_str("MessageSource::Stream"),
            Self::Scalar(_) => f.write_str("MessageSource::Scalar"),
        }
    }
}

// ---------------------------------------------------------------------------
// TargetPredicate
// ---------------------------------------------------------------------------

type PredicateFn<M> = dyn Fn(&M) -> anyhow::Result<bool> + Send + Sync;

/// Decides which message is the one the caller is waiting for. A predicate
/// that errors is treated as "not the target"; the error is recorded.
pub struct TargetPredicate<M> {
    inner: Arc<PredicateFn<M>>,
}

impl<M> Clone for TargetPredicate<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M> TargetPredicate<M> {
    pub fn new(f: impl Fn(&M) -> bool + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(move |m| Ok(f(m))),
        }
    }

    pub fn fallible(f: impl Fn(&M) -> anyhow::Result<bool> + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    /// Any message counts.
    pub fn any() -> Self {
        Self::new(|_| true)
    }

    pub fn check(&self, message: &M) -> anyhow::Result<bool> {
        (self.inner)(message)
    }
}

impl TargetPredicate<claude_stream::Message> {
    /// The terminal result record of a claude query, whatever its outcome.
    pub fn result_message() -> Self {
        Self::new(|m| m.as_result().is_some())
    }

    /// A result record that did not report an error.
    pub fn successful_result() -> Self {
        Self::new(|m| m.as_result().is_some_and(|r| !r.is_error()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_messages_expose_session_id() {
        let v = serde_json::json!({"session_id": "abc"});
        assert_eq!(StreamMessage::session_id(&v), Some("abc"));
        assert_eq!(StreamMessage::session_id(&"x".to_string()), None);
    }

    #[test]
    fn fallible_predicate_surfaces_errors() {
        let p = TargetPredicate::<String>::fallible(|m| {
            if m.is_empty() {
                anyhow::bail!("empty message");
            }
            Ok(m == "done")
        });
        assert!(p.check(&"done".to_string()).unwrap());
        assert!(!p.check(&"other".to_string()).unwrap());
        assert!(p.check(&String::new()).is_err());
    }

    #[test]
    fn successful_result_rejects_error_records() {
        let ok = claude_stream::Message::Result(claude_stream::ResultMessage::success(
            "s1", "fine",
        ));
        let mut failed = claude_stream::ResultMessage::success("s1", "");
        failed.subtype = "error_max_turns".into();
        let failed = claude_stream::Message::Result(failed);
        let p = TargetPredicate::successful_result();
        assert!(p.check(&ok).unwrap());
        assert!(!p.check(&failed).unwrap());
        assert!(TargetPredicate::result_message().check(&failed).unwrap());
    }
}
