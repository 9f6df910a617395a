use std::path::Path;

use serde::Serialize;

use super::RunContext;
use crate::agents::QaReport;
use crate::epic::EpicStory;
use crate::error::Result;
use crate::runlog::events;
use crate::status::{DocumentStatus, ProcessingStatus};
use crate::store::{normalize_qa_result, StatusMetadata, UpdateParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryOutcome {
    Completed,
    /// Round budget used up before the story reached a done status.
    BudgetExhausted,
    /// The story's status could not be determined.
    Error,
    Cancelled,
}

impl StoryOutcome {
    pub fn is_success(self) -> bool {
        self == StoryOutcome::Completed
    }
}

/// What one run of the Dev–QA loop did.
#[derive(Debug, Clone, Serialize)]
pub struct StoryRun {
    pub story: String,
    pub outcome: StoryOutcome,
    pub rounds: u32,
    pub developer_calls: u32,
    pub qa_calls: u32,
    /// Last document status observed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_status: Option<DocumentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StoryRun {
    fn new(story: String) -> Self {
        Self {
            story,
            outcome: StoryOutcome::BudgetExhausted,
            rounds: 0,
            developer_calls: 0,
            qa_calls: 0,
            final_status: None,
            error: None,
        }
    }

    /// A story whose controller never produced a run of its own.
    pub(crate) fn aborted(story: String, outcome: StoryOutcome, reason: impl Into<String>) -> Self {
        Self {
            outcome,
            error: Some(reason.into()),
            ..Self::new(story)
        }
    }
}

/// Drives one story between Developer and QA until its document reaches
/// `Ready for Done`/`Done` or the round budget runs out.
///
/// Each round observes the document status and acts on it:
///
/// | observed | action |
/// |---|---|
/// | Done, Ready for Done | stop, success |
/// | Ready for Review | QA |
/// | Draft, Failed, Ready for Development, In Progress | Developer, then QA even if the Developer failed |
/// | unreadable | record `error`, stop |
/// | anything else | nothing; the round still counts |
///
/// The store is updated on phase boundaries and the document follows
/// through the status synchronizer.
pub struct StoryController {
    ctx: RunContext,
    max_rounds: u32,
}

impl StoryController {
    pub fn new(ctx: RunContext, max_rounds: u32) -> Self {
        Self { ctx, max_rounds }
    }

    pub async fn run(&self, story: &EpicStory) -> Result<StoryRun> {
        let key = story.key();
        let path = self.ctx.root.join(&story.path);
        let mut run = StoryRun::new(key.clone());
        let mut feedback: Option<String> = None;
        self.ctx.log.record(
            events::STORY_START,
            format!("{key} ({}) max_rounds={}", story.title, self.max_rounds),
        );

        for round in 1..=self.max_rounds {
            if self.ctx.cancel.is_cancelled() {
                return self.cancelled(run).await;
            }
            run.rounds = round;
            let Some(observed) = self.ctx.agents.reader.read_status(&path).await else {
                return self.errored(run, "story status could not be determined").await;
            };
            run.final_status = Some(observed);
            self.ctx
                .log
                .record(events::ROUND, format!("{key} round {round}: {observed}"));
            tracing::info!(story = %key, round, status = %observed, "round");

            if observed.is_done() {
                return self.completed(run).await;
            }
            match observed {
                DocumentStatus::ReadyForReview => {
                    self.review(&mut run, &path, round, &mut feedback).await?;
                }
                s if s.needs_development() => {
                    self.develop(&mut run, &path, round, &mut feedback).await?;
                }
                other => {
                    tracing::debug!(story = %key, status = %other, "no action for status");
                }
            }
        }

        if self.ctx.cancel.is_cancelled() {
            return self.cancelled(run).await;
        }
        match self.ctx.agents.reader.read_status(&path).await {
            Some(s) if s.is_done() => {
                run.final_status = Some(s);
                self.completed(run).await
            }
            Some(s) => {
                run.final_status = Some(s);
                run.outcome = StoryOutcome::BudgetExhausted;
                self.ctx.log.record(
                    events::BUDGET_EXHAUSTED,
                    format!(
                        "{} still at {s} after {} round(s), developer called {} time(s)",
                        run.story, run.rounds, run.developer_calls
                    ),
                );
                tracing::warn!(story = %run.story, rounds = run.rounds, "round budget exhausted");
                Ok(run)
            }
            None => self.errored(run, "story status could not be determined").await,
        }
    }

    async fn develop(
        &self,
        run: &mut StoryRun,
        path: &Path,
        round: u32,
        feedback: &mut Option<String>,
    ) -> Result<()> {
        self.set(&run.story, ProcessingStatus::InProgress, "development", round, None, None)
            .await?;
        run.developer_calls += 1;
        let developed = self
            .ctx
            .agents
            .developer
            .develop(path, feedback.as_deref())
            .await;

        if developed {
            self.set(&run.story, ProcessingStatus::Review, "development", round, None, None)
                .await?;
            self.ctx
                .log
                .record(events::PHASE, format!("{} developer done", run.story));
            return self.sync(&run.story).await;
        }

        self.set(
            &run.story,
            ProcessingStatus::InProgress,
            "development",
            round,
            None,
            Some("developer did not finish".to_string()),
        )
        .await?;
        self.ctx.log.record(
            events::PHASE,
            format!("{} developer failed, running QA for diagnostics", run.story),
        );
        run.qa_calls += 1;
        let report = self.ctx.agents.qa.review(path).await;
        self.after_qa(run, round, report, feedback).await
    }

    async fn review(
        &self,
        run: &mut StoryRun,
        path: &Path,
        round: u32,
        feedback: &mut Option<String>,
    ) -> Result<()> {
        self.set(&run.story, ProcessingStatus::InProgress, "qa", round, None, None)
            .await?;
        run.qa_calls += 1;
        let report = self.ctx.agents.qa.review(path).await;
        self.after_qa(run, round, report, feedback).await
    }

    async fn after_qa(
        &self,
        run: &mut StoryRun,
        round: u32,
        report: QaReport,
        feedback: &mut Option<String>,
    ) -> Result<()> {
        let qa_result = normalize_qa_result(&report);
        if report.passed {
            self.set(&run.story, ProcessingStatus::Completed, "qa", round, qa_result, None)
                .await?;
            self.ctx
                .log
                .record(events::PHASE, format!("{} QA passed", run.story));
            *feedback = None;
        } else {
            self.set(
                &run.story,
                ProcessingStatus::InProgress,
                "qa",
                round,
                qa_result,
                Some("QA did not pass".to_string()),
            )
            .await?;
            self.ctx
                .log
                .record(events::PHASE, format!("{} QA failed", run.story));
            *feedback = report.feedback;
        }
        self.sync(&run.story).await
    }

    async fn completed(&self, mut run: StoryRun) -> Result<StoryRun> {
        let stored = self.ctx.store.get_status(&run.story).await?;
        if stored.map(|r| r.status) != Some(ProcessingStatus::Completed) {
            self.set(&run.story, ProcessingStatus::Completed, "done", run.rounds, None, None)
                .await?;
        }
        run.outcome = StoryOutcome::Completed;
        self.ctx.log.record(
            events::STORY_DONE,
            format!("{} completed in {} round(s)", run.story, run.rounds),
        );
        tracing::info!(story = %run.story, rounds = run.rounds, "story completed");
        Ok(run)
    }

    async fn errored(&self, mut run: StoryRun, reason: &str) -> Result<StoryRun> {
        self.ctx
            .store
            .update_status(
                &run.story,
                ProcessingStatus::Error,
                UpdateParams::for_epic(self.ctx.epic_id.as_str())
                    .phase("state_parser")
                    .iteration(run.rounds)
                    .error(reason),
            )
            .await?;
        run.outcome = StoryOutcome::Error;
        run.error = Some(reason.to_string());
        self.ctx
            .log
            .record(events::STORY_ERROR, format!("{}: {reason}", run.story));
        tracing::error!(story = %run.story, reason, "story errored");
        Ok(run)
    }

    async fn cancelled(&self, mut run: StoryRun) -> Result<StoryRun> {
        self.ctx
            .store
            .update_status(
                &run.story,
                ProcessingStatus::Cancelled,
                UpdateParams::for_epic(self.ctx.epic_id.as_str()).iteration(run.rounds),
            )
            .await?;
        run.outcome = StoryOutcome::Cancelled;
        self.ctx
            .log
            .record(events::CANCELLED, format!("{} cancelled", run.story));
        Ok(run)
    }

    async fn set(
        &self,
        story: &str,
        status: ProcessingStatus,
        phase: &str,
        round: u32,
        qa_result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<()> {
        self.ctx
            .store
            .update_processing_status(
                story,
                status,
                None,
                &self.ctx.epic_id,
                StatusMetadata {
                    phase: Some(phase.to_string()),
                    iteration: Some(round),
                    qa_result,
                    error,
                },
            )
            .await?;
        Ok(())
    }

    async fn sync(&self, story: &str) -> Result<()> {
        let report = self
            .ctx
            .sync
            .sync(&self.ctx.epic_id, &[story.to_string()])
            .await?;
        if !report.all_written() {
            self.ctx
                .log
                .record(events::SYNC, format!("{story}: document status not written"));
        }
        Ok(())
    }
}
