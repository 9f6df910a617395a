//! Epic driver: plans an epic, runs every story through the Dev–QA loop,
//! then the quality gate and the test suite.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::agents::Agents;
use crate::config::Config;
use crate::controller::{
    QualityGate, QualityReport, RunContext, StoryController, StoryOutcome, StoryRun,
    TestSuiteController, TestSuiteReport,
};
use crate::epic::{Epic, EpicStory};
use crate::error::Result;
use crate::paths;
use crate::runlog::{events, RunLog};
use crate::sdk::{MonitorSnapshot, SdkExecutor};
use crate::store::{InitReport, StateStore};
use crate::sync::StatusSynchronizer;
use crate::tools::{CommandTool, PytestRunner, QualityTool, TestRunner};

#[derive(Debug, Clone, Serialize)]
pub struct EpicReport {
    pub epic_id: String,
    pub title: String,
    pub log_path: PathBuf,
    pub init: InitReport,
    pub stories: Vec<StoryRun>,
    /// Extra passes made over failed stories.
    pub retry_passes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests: Option<TestSuiteReport>,
    pub cancelled: bool,
    pub sdk: MonitorSnapshot,
}

impl EpicReport {
    pub fn completed(&self) -> usize {
        self.stories
            .iter()
            .filter(|s| s.outcome.is_success())
            .count()
    }

    pub fn all_completed(&self) -> bool {
        !self.cancelled && self.completed() == self.stories.len()
    }

    fn outcome(&self) -> &'static str {
        if self.cancelled {
            "cancelled"
        } else if self.all_completed() {
            "completed"
        } else {
            "partial"
        }
    }
}

pub struct EpicDriver {
    root: PathBuf,
    config: Arc<Config>,
    agents: Agents,
    store: StateStore,
    executor: SdkExecutor,
    quality_tools: Vec<Arc<dyn QualityTool>>,
    test_runner: Option<Arc<dyn TestRunner>>,
}

impl EpicDriver {
    /// A driver with the configured quality tools and pytest. Cancelling
    /// the executor's root token stops the run at the next story boundary.
    pub fn new(
        root: &Path,
        config: Arc<Config>,
        agents: Agents,
        store: StateStore,
        executor: SdkExecutor,
    ) -> Self {
        let timeout = config.timeouts.tool();
        let quality_tools = config
            .quality
            .tools
            .iter()
            .map(|&kind| {
                Arc::new(CommandTool::new(
                    kind,
                    root,
                    &config.quality.source_dir,
                    executor.clone(),
                    timeout,
                )) as Arc<dyn QualityTool>
            })
            .collect();
        let test_runner: Arc<dyn TestRunner> = Arc::new(PytestRunner::new(
            root,
            &config.tests.test_dir,
            executor.clone(),
            timeout,
        ));
        Self {
            root: root.to_path_buf(),
            config,
            agents,
            store,
            executor,
            quality_tools,
            test_runner: Some(test_runner),
        }
    }

    /// Replace the quality tools; an empty list skips the quality phase.
    pub fn with_quality_tools(mut self, tools: Vec<Arc<dyn QualityTool>>) -> Self {
        self.quality_tools = tools;
        self
    }

    /// Replace the test runner; `None` skips the test phase.
    pub fn with_test_runner(mut self, runner: Option<Arc<dyn TestRunner>>) -> Self {
        self.test_runner = runner;
        self
    }

    fn cancel(&self) -> &CancellationToken {
        self.executor.root_token()
    }

    pub async fn run(&self, epic_path: &Path) -> Result<EpicReport> {
        let epic_path = paths::resolve(&self.root, epic_path);
        let epic = Epic::load(&self.root, &epic_path, &self.config.paths.stories_dir)?;
        let log = Arc::new(RunLog::create(
            &paths::resolve(&self.root, &self.config.paths.log_dir),
            &format!("epic {} ({})", epic.id, epic.title),
        )?);
        log.record(
            events::EPIC_START,
            format!("{} with {} stories", epic.id, epic.stories.len()),
        );
        tracing::info!(epic = %epic.id, stories = epic.stories.len(), log = %log.path().display(), "epic started");

        let stories = self.agents.planner.plan(&epic).await;
        let keys: Vec<String> = stories.iter().map(EpicStory::key).collect();
        let init = match self.store.initialize_for_epic(&epic.id, &keys).await {
            Ok(init) => init,
            Err(e) => {
                log.record(events::EPIC_ERROR, format!("state store init failed: {e}"));
                log.finish("error");
                return Err(e);
            }
        };

        let ctx = RunContext {
            root: self.root.clone(),
            epic_id: epic.id.clone(),
            agents: self.agents.clone(),
            store: self.store.clone(),
            sync: StatusSynchronizer::new(
                self.store.clone(),
                Arc::clone(&self.agents.writer),
                &self.root,
            ),
            log: Arc::clone(&log),
            cancel: self.cancel().clone(),
        };

        let mut runs = self.run_pass(&ctx, &stories).await;
        let mut retry_passes = 0;
        while retry_passes < self.config.workflow.story_retries && !self.cancel().is_cancelled() {
            let retry: Vec<EpicStory> = stories
                .iter()
                .zip(&runs)
                .filter(|(_, run)| run.outcome == StoryOutcome::BudgetExhausted)
                .map(|(story, _)| story.clone())
                .collect();
            if retry.is_empty() {
                break;
            }
            retry_passes += 1;
            log.record(
                events::STORY_RETRY,
                format!("pass {}: retrying {} story(ies)", retry_passes + 1, retry.len()),
            );
            let retried = self.run_pass(&ctx, &retry).await;
            for run in retried {
                if let Some(slot) = runs.iter_mut().find(|r| r.story == run.story) {
                    *slot = run;
                }
            }
        }

        let mut report = EpicReport {
            epic_id: epic.id.clone(),
            title: epic.title.clone(),
            log_path: log.path().to_path_buf(),
            init,
            stories: runs,
            retry_passes,
            quality: None,
            tests: None,
            cancelled: self.cancel().is_cancelled(),
            sdk: MonitorSnapshot::default(),
        };

        if !report.cancelled && !self.quality_tools.is_empty() {
            let gate = QualityGate::new(
                self.quality_tools.clone(),
                Arc::clone(&self.agents.fixer),
                Arc::clone(&log),
                self.cancel().clone(),
                self.config.quality.max_cycles,
                self.config.quality.sdk_call_delay(),
            );
            report.quality = Some(gate.run().await);
        }
        if !self.cancel().is_cancelled() {
            if let Some(runner) = &self.test_runner {
                let tests = &self.config.tests;
                let controller = TestSuiteController::new(
                    Arc::clone(runner),
                    Arc::clone(&self.agents.fixer),
                    Arc::clone(&log),
                    self.cancel().clone(),
                    tests.max_cycles,
                    tests.retries_per_cycle,
                    tests.debug_threshold,
                    tests.sdk_call_delay(),
                );
                report.tests = Some(controller.run().await);
            }
        }

        report.cancelled = self.cancel().is_cancelled();
        report.sdk = self.executor.monitor().snapshot();
        log.record(
            events::EPIC_DONE,
            format!(
                "{}: {}/{} stories completed",
                epic.id,
                report.completed(),
                report.stories.len()
            ),
        );
        log.finish(report.outcome());
        tracing::info!(
            epic = %epic.id,
            completed = report.completed(),
            total = report.stories.len(),
            outcome = report.outcome(),
            "epic finished"
        );
        Ok(report)
    }

    /// Run `stories` through their controllers, at most `concurrency` at a
    /// time. Permits are taken in story order, so a limit of one keeps the
    /// run strictly sequential. Each story runs on its own task; a failure
    /// or panic in one is recorded and the rest carry on.
    async fn run_pass(&self, ctx: &RunContext, stories: &[EpicStory]) -> Vec<StoryRun> {
        let limit = self.config.workflow.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut handles = Vec::with_capacity(stories.len());

        for story in stories {
            let key = story.key();
            let permit = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                handles.push((key, None));
                continue;
            };
            let ctx = ctx.clone();
            let story = story.clone();
            let max_rounds = self.config.workflow.max_rounds;
            let handle = tokio::spawn(async move {
                let _permit = permit;
                StoryController::new(ctx, max_rounds).run(&story).await
            });
            handles.push((key, Some(handle)));
        }

        let mut runs = Vec::with_capacity(handles.len());
        for (key, handle) in handles {
            let run = match handle {
                None => StoryRun::aborted(key, StoryOutcome::Cancelled, "run cancelled before start"),
                Some(handle) => match handle.await {
                    Ok(Ok(run)) => run,
                    Ok(Err(e)) => {
                        ctx.log
                            .record(events::STORY_ERROR, format!("{key}: {e}"));
                        tracing::error!(story = %key, error = %e, "story controller failed");
                        StoryRun::aborted(key, StoryOutcome::Error, e.to_string())
                    }
                    Err(e) => {
                        let reason = if e.is_panic() {
                            "story controller panicked".to_string()
                        } else {
                            format!("story task ended abnormally: {e}")
                        };
                        ctx.log
                            .record(events::STORY_ERROR, format!("{key}: {reason}"));
                        tracing::error!(story = %key, "{reason}");
                        StoryRun::aborted(key, StoryOutcome::Error, reason)
                    }
                },
            };
            if run.outcome == StoryOutcome::BudgetExhausted {
                ctx.log.record(
                    events::STORY_FAILED,
                    format!("{} not done after {} round(s)", run.story, run.rounds),
                );
            }
            runs.push(run);
        }
        runs
    }
}
