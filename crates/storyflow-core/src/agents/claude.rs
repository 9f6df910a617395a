use std::path::Path;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;

use super::{
    prompt, result_text, AgentContext, Developer, FixRequest, Fixer, QaReport, QualityAssurance,
    StatusReader, StatusWriter, StoryPlanner,
};
use crate::epic::{Epic, EpicStory};
use crate::status::DocumentStatus;
use crate::{io, story};

// ---------------------------------------------------------------------------
// Scrum-Master
// ---------------------------------------------------------------------------

pub struct ClaudeScrumMaster {
    ctx: Arc<AgentContext>,
}

impl ClaudeScrumMaster {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl StoryPlanner for ClaudeScrumMaster {
    async fn plan(&self, epic: &Epic) -> Vec<EpicStory> {
        let root = &self.ctx.root;
        let missing: Vec<&EpicStory> = epic
            .stories
            .iter()
            .filter(|s| !root.join(&s.path).exists())
            .collect();

        if !missing.is_empty() {
            let epic_text = std::fs::read_to_string(&epic.path).unwrap_or_default();
            let paths: Vec<&Path> = missing.iter().map(|s| s.path.as_path()).collect();
            let result = self
                .ctx
                .ask(
                    "scrum_master",
                    prompt::scrum_master(epic, &epic_text, &paths),
                    self.ctx.config.timeouts.scrum_master(),
                )
                .await;
            if !result.success() {
                tracing::warn!(epic = %epic.id, summary = %result.summary(), "scrum master did not finish drafting");
            }
        }

        let mut planned = Vec::with_capacity(epic.stories.len());
        for s in &epic.stories {
            let path = root.join(&s.path);
            if !path.exists() {
                let doc = story::skeleton(&s.id, &s.title, &epic.id);
                if let Err(e) = io::write_if_missing(&path, doc.as_bytes()) {
                    tracing::warn!(story = %s.key(), error = %e, "could not write draft story");
                    continue;
                }
                tracing::info!(story = %s.key(), "wrote skeleton draft");
            }
            planned.push(s.clone());
        }
        planned
    }
}

// ---------------------------------------------------------------------------
// State parser
// ---------------------------------------------------------------------------

pub struct ClaudeStateParser {
    ctx: Arc<AgentContext>,
}

impl ClaudeStateParser {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl StatusReader for ClaudeStateParser {
    async fn read_status(&self, story_path: &Path) -> Option<DocumentStatus> {
        let doc = match story::read(story_path) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(story = %story_path.display(), error = %e, "story document unreadable");
                return None;
            }
        };
        if let Some(status) = story::parse_status(&doc) {
            return Some(status);
        }

        tracing::debug!(story = %story_path.display(), "status not canonical, asking state parser agent");
        let result = self
            .ctx
            .ask(
                "state_parser",
                prompt::state_parser(story_path),
                self.ctx.config.timeouts.state_parser(),
            )
            .await;
        result_text(&result).and_then(status_from_reply)
    }
}

/// Pick a canonical status out of a free-form reply: an exact line first,
/// otherwise the longest canonical phrase mentioned.
pub(crate) fn status_from_reply(reply: &str) -> Option<DocumentStatus> {
    if let Some(status) = reply.lines().rev().find_map(DocumentStatus::parse) {
        return Some(status);
    }
    let lower = reply.to_lowercase();
    DocumentStatus::all()
        .iter()
        .copied()
        .filter(|s| lower.contains(&s.as_str().to_lowercase()))
        .max_by_key(|s| s.as_str().len())
}

// ---------------------------------------------------------------------------
// Developer
// ---------------------------------------------------------------------------

pub struct ClaudeDeveloper {
    ctx: Arc<AgentContext>,
}

impl ClaudeDeveloper {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Developer for ClaudeDeveloper {
    async fn develop(&self, story_path: &Path, feedback: Option<&str>) -> bool {
        let result = self
            .ctx
            .ask(
                "developer",
                prompt::developer(story_path, feedback),
                self.ctx.config.timeouts.developer(),
            )
            .await;
        result.success()
    }
}

// ---------------------------------------------------------------------------
// QA
// ---------------------------------------------------------------------------

static VERDICT_RE: OnceLock<Regex> = OnceLock::new();

fn verdict_re() -> &'static Regex {
    VERDICT_RE.get_or_init(|| Regex::new(r"(?im)^[\s*_#>-]*verdict[\s*_]*:[\s*_]*(pass|fail)").unwrap())
}

/// Last `VERDICT: PASS|FAIL` line of a QA reply.
pub(crate) fn parse_verdict(reply: &str) -> Option<bool> {
    verdict_re()
        .captures_iter(reply)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().eq_ignore_ascii_case("pass"))
}

pub struct ClaudeQa {
    ctx: Arc<AgentContext>,
}

impl ClaudeQa {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl QualityAssurance for ClaudeQa {
    async fn review(&self, story_path: &Path) -> QaReport {
        let result = self
            .ctx
            .ask("qa", prompt::qa(story_path), self.ctx.config.timeouts.qa())
            .await;
        if !result.success() {
            return QaReport {
                session_id: result.session_id.clone(),
                ..QaReport::fail(format!("QA review did not complete: {}", result.summary()))
            };
        }
        let reply = result_text(&result).unwrap_or_default();
        let mut report = match parse_verdict(reply) {
            Some(true) => QaReport::pass(),
            Some(false) => QaReport::fail(reply.trim()),
            None => {
                tracing::warn!(story = %story_path.display(), "QA reply carried no verdict");
                QaReport::fail(format!("QA reply carried no verdict:\n{}", reply.trim()))
            }
        };
        report.session_id = result.session_id.clone();
        report
    }
}

// ---------------------------------------------------------------------------
// Status updater
// ---------------------------------------------------------------------------

pub struct ClaudeStatusUpdater {
    ctx: Arc<AgentContext>,
}

impl ClaudeStatusUpdater {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl StatusWriter for ClaudeStatusUpdater {
    async fn write_status(&self, story_path: &Path, status: DocumentStatus) -> bool {
        match story::read_status(story_path) {
            Ok(Some(current)) if current == status => return true,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(story = %story_path.display(), error = %e, "cannot update status");
                return false;
            }
        }

        let result = self
            .ctx
            .ask(
                "status_updater",
                prompt::status_update(story_path, status),
                self.ctx.config.timeouts.status_update(),
            )
            .await;

        let doc = match story::read(story_path) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(story = %story_path.display(), error = %e, "story vanished during status update");
                return false;
            }
        };
        if story::parse_status(&doc) == Some(status) {
            return true;
        }

        tracing::warn!(
            story = %story_path.display(),
            status = %status,
            agent_ok = result.success(),
            "status section not updated by agent, rewriting it directly"
        );
        match io::atomic_write(story_path, story::replace_status(&doc, status).as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(story = %story_path.display(), error = %e, "status rewrite failed");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fixer
// ---------------------------------------------------------------------------

pub struct ClaudeFixer {
    ctx: Arc<AgentContext>,
}

impl ClaudeFixer {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Fixer for ClaudeFixer {
    async fn fix(&self, request: FixRequest) -> bool {
        let result = self
            .ctx
            .ask(&request.label, request.prompt, self.ctx.config.timeouts.fix())
            .await;
        result.success()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentTransport, DryRunTransport};
    use crate::config::Config;
    use crate::sdk::SdkExecutor;
    use claude_stream::{Message, QueryOptions};
    use crate::sdk::{MessageSource, SourceError};
    use tempfile::TempDir;

    fn ctx(root: &Path, transport: Arc<dyn AgentTransport>) -> Arc<AgentContext> {
        Arc::new(AgentContext::new(
            root.to_path_buf(),
            Arc::new(Config::default()),
            SdkExecutor::default(),
            transport,
        ))
    }

    /// Transport whose calls always fail at the protocol level.
    struct BrokenTransport;

    impl AgentTransport for BrokenTransport {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn source(&self, _prompt: String, _opts: QueryOptions) -> MessageSource<Message> {
            MessageSource::from_items(vec![Err(SourceError::Transport(
                claude_stream::StreamError::Process("exit status 1".into()),
            ))])
        }
    }

    #[test]
    fn verdicts() {
        assert_eq!(parse_verdict("all good\nVERDICT: PASS"), Some(true));
        assert_eq!(parse_verdict("**Verdict**: fail\n- no tests"), Some(false));
        assert_eq!(parse_verdict("VERDICT: FAIL\n...\nVERDICT: PASS"), Some(true));
        assert_eq!(parse_verdict("looks fine"), None);
    }

    #[test]
    fn status_from_free_text() {
        assert_eq!(
            status_from_reply("The status is:\nReady for Review"),
            Some(DocumentStatus::ReadyForReview)
        );
        assert_eq!(
            status_from_reply("It says `ready for done` at the top."),
            Some(DocumentStatus::ReadyForDone)
        );
        assert_eq!(status_from_reply("no idea"), None);
    }

    #[tokio::test]
    async fn dry_run_qa_passes() {
        let dir = TempDir::new().unwrap();
        let qa = ClaudeQa::new(ctx(dir.path(), Arc::new(DryRunTransport::default())));
        assert!(qa.review(&dir.path().join("s.md")).await.passed);
    }

    #[tokio::test]
    async fn transport_failure_is_a_plain_false() {
        let dir = TempDir::new().unwrap();
        let c = ctx(dir.path(), Arc::new(BrokenTransport));
        assert!(!ClaudeDeveloper::new(Arc::clone(&c)).develop(Path::new("s.md"), None).await);
        let report = ClaudeQa::new(c).review(Path::new("s.md")).await;
        assert!(!report.passed);
        assert!(report.feedback.unwrap().contains("did not complete"));
    }

    #[tokio::test]
    async fn status_updater_falls_back_to_direct_rewrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1.1.md");
        std::fs::write(&path, "# Story 1.1: A\n\n## Status\nDraft\n\n## Story\nx\n").unwrap();
        let writer = ClaudeStatusUpdater::new(ctx(dir.path(), Arc::new(DryRunTransport::default())));
        assert!(writer.write_status(&path, DocumentStatus::ReadyForReview).await);
        assert_eq!(
            story::read_status(&path).unwrap(),
            Some(DocumentStatus::ReadyForReview)
        );
    }

    #[tokio::test]
    async fn status_updater_rejects_missing_document() {
        let dir = TempDir::new().unwrap();
        let writer = ClaudeStatusUpdater::new(ctx(dir.path(), Arc::new(DryRunTransport::default())));
        assert!(!writer.write_status(&dir.path().join("nope.md"), DocumentStatus::Done).await);
    }

    #[tokio::test]
    async fn state_parser_reads_locally_then_asks_agent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.md");
        std::fs::write(&path, "# S\n\n## Status\nIn Progress\n").unwrap();
        let reader = ClaudeStateParser::new(ctx(
            dir.path(),
            Arc::new(DryRunTransport::new("Ready for Review")),
        ));
        assert_eq!(reader.read_status(&path).await, Some(DocumentStatus::InProgress));

        std::fs::write(&path, "# S\n\n## Status\nWaiting on design\n").unwrap();
        assert_eq!(reader.read_status(&path).await, Some(DocumentStatus::ReadyForReview));
        assert_eq!(reader.read_status(&dir.path().join("missing.md")).await, None);
    }

    #[tokio::test]
    async fn scrum_master_drafts_missing_documents() {
        let dir = TempDir::new().unwrap();
        let epic_path = dir.path().join("docs/epics/epic-1.md");
        std::fs::create_dir_all(epic_path.parent().unwrap()).unwrap();
        std::fs::write(&epic_path, "# Epic 1\n\n## Story 1.1: First\n## Story 1.2: Second\n").unwrap();
        let epic = Epic::load(dir.path(), &epic_path, Path::new("docs/stories")).unwrap();
        let existing = dir.path().join(&epic.stories[0].path);
        std::fs::create_dir_all(existing.parent().unwrap()).unwrap();
        std::fs::write(&existing, "# Story 1.1: First\n\n## Status\nReady for Review\n").unwrap();

        let sm = ClaudeScrumMaster::new(ctx(dir.path(), Arc::new(DryRunTransport::default())));
        let planned = sm.plan(&epic).await;
        assert_eq!(planned.len(), 2);
        assert_eq!(
            story::read_status(&existing).unwrap(),
            Some(DocumentStatus::ReadyForReview)
        );
        assert_eq!(
            story::read_status(&dir.path().join(&epic.stories[1].path)).unwrap(),
            Some(DocumentStatus::Draft)
        );
    }
}
