//! SDK execution layer.
//!
//! Every agent call and every quality-tool run goes through
//! [`SdkExecutor::execute`]. The executor runs the source on its own Tokio
//! task with its own cancellation scope, so nothing the source does (or
//! suffers) can cancel the caller, and a caller that gives up cannot tear
//! the source down half way. Callers get an [`SdkResult`] back on every
//! path; `execute` has no error type.
//!
//! Completion is a two-flag affair tracked by the [`CancellationManager`]:
//! a call is finished only when the target message was observed *and* the
//! source has been cleaned up. [`SdkResult::success`] is the only success
//! test callers should use.
//!
//! Timeouts live inside `execute`. Wrapping an `execute` future in
//! `tokio::time::timeout` or `select!` against something else is not
//! supported: it detaches the running source instead of stopping it.

pub mod cancel;
pub mod executor;
pub mod monitor;
pub mod result;
pub mod source;

pub use cancel::{CallGuard, CallId, CallRecord, CancellationManager};
pub use executor::{ExecuteOptions, SdkExecutor};
pub use monitor::{MonitorSnapshot, SdkMonitor};
pub use result::{SdkErrorKind, SdkResult};
pub use source::{MessageSource, SourceError, StreamMessage, TargetPredicate};
