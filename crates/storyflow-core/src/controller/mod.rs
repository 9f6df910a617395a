//! State-machine controllers.
//!
//! - [`StoryController`]: the Dev–QA loop of one story.
//! - [`QualityGate`]: per-file fix loop over linter and type-checker output.
//! - [`TestSuiteController`]: retry loop over a failing test suite.
//!
//! Controllers call agents and tools directly. SDK calls are bounded only
//! by the execution layer's own timeout; nothing here wraps them in another
//! timeout or cancellation primitive. The cancel token is checked between
//! calls and during rate-limit pauses.

mod quality_gate;
mod story;
mod test_suite;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agents::Agents;
use crate::runlog::RunLog;
use crate::store::StateStore;
use crate::sync::StatusSynchronizer;

pub use quality_gate::{QualityGate, QualityReport, ToolGateResult};
pub use story::{StoryController, StoryOutcome, StoryRun};
pub use test_suite::{TestSuiteController, TestSuiteOutcome, TestSuiteReport};

/// Shared state of the controllers working on one epic.
#[derive(Clone)]
pub struct RunContext {
    pub root: PathBuf,
    pub epic_id: String,
    pub agents: Agents,
    pub store: StateStore,
    pub sync: StatusSynchronizer,
    pub log: Arc<RunLog>,
    pub cancel: CancellationToken,
}

/// Sleep for `delay` unless the run is cancelled first. Returns `false` on
/// cancellation.
pub(crate) async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    if delay.is_zero() {
        return true;
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pause_sleeps_the_full_delay() {
        let cancel = CancellationToken::new();
        let start = std::time::Instant::now();
        assert!(pause(Duration::from_millis(50), &cancel).await);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn pause_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let start = std::time::Instant::now();
        assert!(!pause(Duration::from_secs(30), &cancel).await);
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
