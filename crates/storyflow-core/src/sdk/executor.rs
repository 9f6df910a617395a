use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::cancel::{CallGuard, CallId, CancellationManager};
use super::monitor::SdkMonitor;
use super::result::{SdkErrorKind, SdkResult};
use super::source::{MessageSource, SourceError, StreamFactory, StreamMessage, TargetPredicate};

/// How long `execute` waits for a finished call to satisfy the
/// double-condition invariant before reporting it as not cleaned up.
const DEFAULT_SAFE_WAIT: Duration = Duration::from_secs(5);

/// Per-call options for [`SdkExecutor::execute`].
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub agent_name: String,
    pub timeout: Duration,
    /// Scope the call's own scope is derived from. Defaults to the
    /// executor's root token.
    pub parent: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn new(agent_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            agent_name: agent_name.into(),
            timeout,
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: CancellationToken) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// Runs message sources in isolated scopes and folds every outcome into an
/// [`SdkResult`].
#[derive(Debug, Clone)]
pub struct SdkExecutor {
    manager: Arc<CancellationManager>,
    monitor: Arc<SdkMonitor>,
    root: CancellationToken,
    safe_wait: Duration,
}

impl Default for SdkExecutor {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl SdkExecutor {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            manager: Arc::new(CancellationManager::new()),
            monitor: Arc::new(SdkMonitor::new()),
            root,
            safe_wait: DEFAULT_SAFE_WAIT,
        }
    }

    pub fn with_safe_wait(mut self, wait: Duration) -> Self {
        self.safe_wait = wait;
        self
    }

    pub fn manager(&self) -> &Arc<CancellationManager> {
        &self.manager
    }

    pub fn monitor(&self) -> &Arc<SdkMonitor> {
        &self.monitor
    }

    /// Token whose cancellation aborts every call this executor runs.
    pub fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    /// Run `source` to completion on a dedicated task and report what
    /// happened. Never fails and never panics on behalf of the source.
    ///
    /// After the target message is seen the source keeps being drained
    /// until it ends on its own; the call is only marked for cancellation.
    pub async fn execute<M: StreamMessage>(
        &self,
        source: MessageSource<M>,
        predicate: TargetPredicate<M>,
        opts: ExecuteOptions,
    ) -> SdkResult<M> {
        let started = std::time::Instant::now();
        let scope = opts.parent.as_ref().unwrap_or(&self.root).child_token();
        let guard = self.manager.guard(&opts.agent_name);
        let id = guard.id();
        let mut abandon = AbandonGuard {
            manager: Arc::clone(&self.manager),
            scope: scope.clone(),
            id,
            armed: true,
        };

        tracing::debug!(call = %id, agent = %opts.agent_name, timeout = ?opts.timeout, "sdk call started");

        let deadline = Instant::now() + opts.timeout;
        let task = tokio::spawn(drive(
            source,
            predicate,
            scope,
            deadline,
            opts.timeout,
            guard,
            opts.agent_name.clone(),
        ));
        let joined = task.await;
        abandon.armed = false;

        let mut result = match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let text = panic_text(&*e.into_panic());
                let mut r = SdkResult::new(&opts.agent_name);
                r.fail(SdkErrorKind::Unknown, format!("source task panicked: {text}"));
                r.last_error = Some(SourceError::Panicked(text));
                r
            }
            Err(e) => {
                // The task was torn down from outside (runtime shutdown) rather
                // than through its own scope.
                tracing::error!(call = %id, agent = %opts.agent_name, error = %e, "sdk task cancelled outside its scope");
                let mut r = SdkResult::new(&opts.agent_name);
                r.fail(SdkErrorKind::CancelScopeError, e.to_string());
                r.last_error = Some(SourceError::ScopeViolation(e.to_string()));
                r
            }
        };

        self.manager.request_cancel(id);
        let safe = self
            .manager
            .confirm_safe_to_proceed(id, self.safe_wait)
            .await;
        let record = self.manager.unregister(id);
        result.cleanup_completed = record.map_or(safe, |r| r.cleanup_completed);
        result.duration = started.elapsed();

        self.monitor.record(
            &result.agent_name,
            result.error_kind,
            result.success(),
            result.duration,
        );
        if !result.success() {
            tracing::info!(call = %id, summary = %result.summary(), "sdk call did not succeed");
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Abandon guard
// ---------------------------------------------------------------------------

/// Armed while `execute` is waiting on its task. If the `execute` future is
/// dropped early the call's scope is cancelled and the record is left for
/// the task's own guard to remove.
struct AbandonGuard {
    manager: Arc<CancellationManager>,
    scope: CancellationToken,
    id: CallId,
    armed: bool,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(call = %self.id, "sdk call abandoned by caller; cancelling its scope");
            self.scope.cancel();
            self.manager.orphan(self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Driving a source
// ---------------------------------------------------------------------------

enum Outcome {
    Exhausted,
    Failed(SourceError),
    Cancelled,
    TimedOut,
}

async fn drive<M: StreamMessage>(
    source: MessageSource<M>,
    predicate: TargetPredicate<M>,
    scope: CancellationToken,
    deadline: Instant,
    timeout: Duration,
    guard: CallGuard,
    agent_name: String,
) -> SdkResult<M> {
    let mut result = SdkResult::new(&agent_name);

    let outcome = match source {
        MessageSource::Stream(factory) => {
            drain_stream(factory, &predicate, &scope, deadline, &guard, &mut result).await
        }
        MessageSource::Scalar(fut) => {
            let fut = AssertUnwindSafe(fut).catch_unwind();
            tokio::select! {
                biased;
                _ = scope.cancelled() => Outcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Outcome::TimedOut,
                out = fut => match out {
                    Ok(Ok(message)) => {
                        observe(message, &predicate, &guard, &mut result);
                        Outcome::Exhausted
                    }
                    Ok(Err(e)) => Outcome::Failed(e),
                    Err(panic) => Outcome::Failed(SourceError::Panicked(panic_text(&*panic))),
                },
            }
        }
    };

    match outcome {
        Outcome::Exhausted if result.has_target_result => {
            result.error_kind = SdkErrorKind::Success;
        }
        Outcome::Exhausted => {
            result.fail(SdkErrorKind::Unknown, "source ended without a target message");
        }
        Outcome::Failed(e) => {
            let kind = SdkErrorKind::classify(&e);
            if kind == SdkErrorKind::CancelScopeError {
                tracing::error!(call = %guard.id(), agent = %agent_name, error = %e, "cancel scope violation inside sdk call");
            }
            result.fail(kind, e.to_string());
            result.last_error = Some(e);
        }
        Outcome::Cancelled => result.fail(SdkErrorKind::Cancelled, "call cancelled"),
        Outcome::TimedOut => result.fail(
            SdkErrorKind::Timeout,
            format!("timed out after {}s", timeout.as_secs_f64()),
        ),
    }
    for e in &result.errors {
        guard.manager().record_error(guard.id(), e.clone());
    }

    drop(guard);
    result
}

async fn drain_stream<M: StreamMessage>(
    factory: StreamFactory<M>,
    predicate: &TargetPredicate<M>,
    scope: &CancellationToken,
    deadline: Instant,
    guard: &CallGuard,
    result: &mut SdkResult<M>,
) -> Outcome {
    let mut stream = match std::panic::catch_unwind(AssertUnwindSafe(factory)) {
        Ok(stream) => stream,
        Err(panic) => return Outcome::Failed(SourceError::Panicked(panic_text(&*panic))),
    };
    loop {
        let next = tokio::select! {
            biased;
            _ = scope.cancelled() => return Outcome::Cancelled,
            _ = tokio::time::sleep_until(deadline) => return Outcome::TimedOut,
            next = AssertUnwindSafe(stream.next()).catch_unwind() => next,
        };
        match next {
            Ok(Some(Ok(message))) => observe(message, predicate, guard, result),
            Ok(Some(Err(e))) => return Outcome::Failed(e),
            Ok(None) => return Outcome::Exhausted,
            Err(panic) => return Outcome::Failed(SourceError::Panicked(panic_text(&*panic))),
        }
    }
}

fn observe<M: StreamMessage>(
    message: M,
    predicate: &TargetPredicate<M>,
    guard: &CallGuard,
    result: &mut SdkResult<M>,
) {
    if result.session_id.is_none() {
        result.session_id = message.session_id().map(str::to_string);
    }
    let is_target = !result.has_target_result
        && match std::panic::catch_unwind(AssertUnwindSafe(|| predicate.check(&message))) {
            Ok(Ok(hit)) => hit,
            Ok(Err(e)) => {
                result.errors.push(format!("target predicate failed: {e:#}"));
                false
            }
            Err(panic) => {
                result
                    .errors
                    .push(format!("target predicate panicked: {}", panic_text(&*panic)));
                false
            }
        };
    if is_target {
        guard.manager().mark_target_found(guard.id());
        guard.manager().request_cancel(guard.id());
        tracing::trace!(call = %guard.id(), index = result.messages.len(), "target message observed");
    }
    result.push_message(message, is_target);
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use claude_stream::StreamError;

    fn opts(timeout_ms: u64) -> ExecuteOptions {
        ExecuteOptions::new("test-agent", Duration::from_millis(timeout_ms))
    }

    fn items(n: usize) -> Vec<Result<String, SourceError>> {
        (1..=n).map(|i| Ok(format!("m{i}"))).collect()
    }

    #[tokio::test]
    async fn fifth_of_ten_messages_is_the_target() {
        let exec = SdkExecutor::default();
        let result = exec
            .execute(
                MessageSource::from_items(items(10)),
                TargetPredicate::new(|m: &String| m == "m5"),
                opts(1_000),
            )
            .await;
        assert!(result.has_target_result);
        assert!(result.cleanup_completed);
        assert!(result.success());
        assert_eq!(result.error_kind, SdkErrorKind::Success);
        assert_eq!(result.target_message().map(String::as_str), Some("m5"));
        assert_eq!(result.messages.len(), 10);
    }

    #[tokio::test]
    async fn failure_after_two_messages_is_captured() {
        let exec = SdkExecutor::default();
        let mut source = items(2);
        source.push(Err(SourceError::Transport(StreamError::Process(
            "connection reset".into(),
        ))));
        source.push(Ok("never".into()));
        let result = exec
            .execute(
                MessageSource::from_items(source),
                TargetPredicate::new(|m: &String| m == "never"),
                opts(1_000),
            )
            .await;
        assert!(!result.has_target_result);
        assert!(result.cleanup_completed);
        assert!(!result.success());
        assert!(matches!(
            result.error_kind,
            SdkErrorKind::SdkError | SdkErrorKind::Unknown
        ));
        assert_eq!(result.messages.len(), 2);
        assert!(result.last_error.is_some());
    }

    #[tokio::test]
    async fn panicking_source_still_cleans_up() {
        let exec = SdkExecutor::default();
        let source = MessageSource::stream(|| {
            futures::stream::iter(vec![1, 2]).map(|i| {
                if i == 2 {
                    panic!("source blew up");
                }
                Ok::<_, SourceError>(format!("m{i}"))
            })
        });
        let result = exec.execute(source, TargetPredicate::any(), opts(1_000)).await;
        assert!(result.has_target_result);
        assert!(result.cleanup_completed);
        assert_eq!(result.error_kind, SdkErrorKind::Unknown);
        assert_eq!(result.messages.len(), 1);
        assert!(result.errors.iter().any(|e| e.contains("source blew up")));
    }

    #[tokio::test]
    async fn timeout_is_enforced_inside_execute() {
        let exec = SdkExecutor::default();
        let source = MessageSource::stream(|| {
            futures::stream::iter(vec![Ok::<_, SourceError>("first".to_string())])
                .chain(futures::stream::pending())
        });
        let result = exec
            .execute(
                source,
                TargetPredicate::new(|m: &String| m == "result"),
                opts(50),
            )
            .await;
        assert_eq!(result.error_kind, SdkErrorKind::Timeout);
        assert!(result.cleanup_completed);
        assert_eq!(result.messages.len(), 1);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn parent_cancellation_yields_cancelled() {
        let exec = SdkExecutor::default();
        let parent = CancellationToken::new();
        let trigger = parent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let source = MessageSource::<String>::stream(futures::stream::pending);
        let result = exec
            .execute(source, TargetPredicate::any(), opts(5_000).with_parent(parent))
            .await;
        assert_eq!(result.error_kind, SdkErrorKind::Cancelled);
        assert!(result.cleanup_completed);
        assert!(!exec.root_token().is_cancelled());
    }

    #[tokio::test]
    async fn predicate_errors_do_not_abort_the_call() {
        let exec = SdkExecutor::default();
        let predicate = TargetPredicate::fallible(|m: &String| {
            if m == "m1" {
                anyhow::bail!("cannot judge m1");
            }
            Ok(m == "m3")
        });
        let result = exec
            .execute(MessageSource::from_items(items(4)), predicate, opts(1_000))
            .await;
        assert!(result.success());
        assert_eq!(result.target_message().map(String::as_str), Some("m3"));
        assert_eq!(result.messages.len(), 4);
        assert!(result.errors[0].contains("cannot judge m1"));
    }

    #[tokio::test]
    async fn stream_without_target_is_unknown() {
        let exec = SdkExecutor::default();
        let result = exec
            .execute(
                MessageSource::from_items(items(3)),
                TargetPredicate::new(|_: &String| false),
                opts(1_000),
            )
            .await;
        assert!(!result.success());
        assert!(result.cleanup_completed);
        assert_eq!(result.error_kind, SdkErrorKind::Unknown);
    }

    #[tokio::test]
    async fn scalar_source_is_detected() {
        let exec = SdkExecutor::default();
        let ok = exec
            .execute(
                MessageSource::scalar(async { Ok::<_, SourceError>("42".to_string()) }),
                TargetPredicate::any(),
                opts(1_000),
            )
            .await;
        assert!(ok.success());
        assert_eq!(ok.messages, vec!["42".to_string()]);

        let failed = exec
            .execute(
                MessageSource::<String>::scalar(async { Err(SourceError::other("exit 2")) }),
                TargetPredicate::any(),
                opts(1_000),
            )
            .await;
        assert!(!failed.success());
        assert!(failed.cleanup_completed);
        assert_eq!(failed.error_kind, SdkErrorKind::Unknown);
    }

    #[tokio::test]
    async fn sequential_calls_never_corrupt_the_caller_scope() {
        let exec = SdkExecutor::default();
        let caller = CancellationToken::new();
        for round in 0..20 {
            let source = if round % 3 == 0 {
                MessageSource::from_items(vec![Err(SourceError::other("flaky"))])
            } else {
                MessageSource::from_items(items(3))
            };
            let result = exec
                .execute(
                    source,
                    TargetPredicate::new(|m: &String| m == "m3"),
                    opts(1_000).with_parent(caller.clone()),
                )
                .await;
            assert_ne!(result.error_kind, SdkErrorKind::CancelScopeError);
            assert!(result.cleanup_completed);
            assert!(!caller.is_cancelled());
        }
        assert_eq!(exec.manager().active_count(), 0);
        assert_eq!(exec.monitor().snapshot().total_calls, 20);
    }

    #[tokio::test]
    async fn concurrent_calls_are_independent() {
        let exec = SdkExecutor::default();
        let doomed = CancellationToken::new();
        let mut calls = Vec::new();
        for i in 0..6 {
            let exec = exec.clone();
            let doomed = doomed.clone();
            calls.push(tokio::spawn(async move {
                if i == 0 {
                    let source = MessageSource::<String>::stream(futures::stream::pending);
                    exec.execute(source, TargetPredicate::any(), opts(5_000).with_parent(doomed))
                        .await
                } else {
                    exec.execute(
                        MessageSource::from_items(items(5)),
                        TargetPredicate::new(|m: &String| m == "m5"),
                        opts(5_000),
                    )
                    .await
                }
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        doomed.cancel();

        for (i, call) in calls.into_iter().enumerate() {
            let result = call.await.unwrap();
            assert!(result.cleanup_completed);
            if i == 0 {
                assert_eq!(result.error_kind, SdkErrorKind::Cancelled);
            } else {
                assert!(result.success(), "call {i}: {}", result.summary());
            }
        }
        assert_eq!(exec.manager().active_count(), 0);
    }

    #[tokio::test]
    async fn abandoned_call_is_cancelled_and_unregistered() {
        let exec = SdkExecutor::default();
        let exec2 = exec.clone();
        let caller = tokio::spawn(async move {
            let source = MessageSource::<String>::stream(futures::stream::pending);
            exec2.execute(source, TargetPredicate::any(), opts(60_000)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(exec.manager().active_count(), 1);
        caller.abort();
        let _ = caller.await;

        let deadline = Instant::now() + Duration::from_secs(2);
        while exec.manager().active_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(exec.manager().active_count(), 0);
    }
}
