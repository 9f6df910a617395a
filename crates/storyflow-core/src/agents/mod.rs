//! Worker agents.
//!
//! Each agent builds a prompt, runs it through the SDK execution layer and
//! turns the [`SdkResult`] into a plain domain value. Agents never return
//! transport errors; a failed call is just `false` or `None`.
//!
//! Controllers depend on the traits below, so tests can swap any agent for
//! a scripted one.

mod claude;
pub mod prompt;
pub mod transport;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use claude_stream::{Message, QueryOptions};
use serde::Serialize;

use crate::config::Config;
use crate::epic::{Epic, EpicStory};
use crate::paths;
use crate::sdk::{ExecuteOptions, SdkExecutor, SdkResult, TargetPredicate};
use crate::status::DocumentStatus;

pub use claude::{
    ClaudeDeveloper, ClaudeFixer, ClaudeQa, ClaudeScrumMaster, ClaudeStateParser,
    ClaudeStatusUpdater,
};
pub use transport::{AgentTransport, ClaudeCliTransport, DryRunTransport};

// ---------------------------------------------------------------------------
// Agent traits
// ---------------------------------------------------------------------------

/// Scrum-Master: makes sure every story of an epic has a document.
#[async_trait]
pub trait StoryPlanner: Send + Sync {
    /// Returns the stories that have a document once planning is done.
    async fn plan(&self, epic: &Epic) -> Vec<EpicStory>;
}

/// State parser: reads the Status section of a story document.
#[async_trait]
pub trait StatusReader: Send + Sync {
    async fn read_status(&self, story: &Path) -> Option<DocumentStatus>;
}

#[async_trait]
pub trait Developer: Send + Sync {
    async fn develop(&self, story: &Path, feedback: Option<&str>) -> bool;
}

#[async_trait]
pub trait QualityAssurance: Send + Sync {
    async fn review(&self, story: &Path) -> QaReport;
}

/// Status updater: the only writer of Status sections.
#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn write_status(&self, story: &Path, status: DocumentStatus) -> bool;
}

/// Applies a fix described by a prompt (quality findings, failing tests).
#[async_trait]
pub trait Fixer: Send + Sync {
    async fn fix(&self, request: FixRequest) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QaReport {
    pub passed: bool,
    /// Issues for the next developer round; the reply text when failing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl QaReport {
    pub fn pass() -> Self {
        Self {
            passed: true,
            ..Self::default()
        }
    }

    pub fn fail(feedback: impl Into<String>) -> Self {
        Self {
            passed: false,
            feedback: Some(feedback.into()),
            session_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FixRequest {
    /// Agent name for logs and monitoring, e.g. `fix:ruff`.
    pub label: String,
    pub prompt: String,
}

/// The agents one workflow run uses.
#[derive(Clone)]
pub struct Agents {
    pub planner: Arc<dyn StoryPlanner>,
    pub reader: Arc<dyn StatusReader>,
    pub developer: Arc<dyn Developer>,
    pub qa: Arc<dyn QualityAssurance>,
    pub writer: Arc<dyn StatusWriter>,
    pub fixer: Arc<dyn Fixer>,
}

impl Agents {
    /// Claude-backed agents sharing one context.
    pub fn claude(ctx: Arc<AgentContext>) -> Self {
        Self {
            planner: Arc::new(ClaudeScrumMaster::new(Arc::clone(&ctx))),
            reader: Arc::new(ClaudeStateParser::new(Arc::clone(&ctx))),
            developer: Arc::new(ClaudeDeveloper::new(Arc::clone(&ctx))),
            qa: Arc::new(ClaudeQa::new(Arc::clone(&ctx))),
            writer: Arc::new(ClaudeStatusUpdater::new(Arc::clone(&ctx))),
            fixer: Arc::new(ClaudeFixer::new(ctx)),
        }
    }
}

// ---------------------------------------------------------------------------
// AgentContext
// ---------------------------------------------------------------------------

/// What every Claude-backed agent needs: project root, config, executor and
/// transport.
pub struct AgentContext {
    pub root: PathBuf,
    pub config: Arc<Config>,
    pub executor: SdkExecutor,
    transport: Arc<dyn AgentTransport>,
}

impl AgentContext {
    pub fn new(
        root: PathBuf,
        config: Arc<Config>,
        executor: SdkExecutor,
        transport: Arc<dyn AgentTransport>,
    ) -> Self {
        Self {
            root,
            config,
            executor,
            transport,
        }
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub fn query_options(&self) -> QueryOptions {
        let agent = &self.config.agent;
        let mut env = HashMap::new();
        if let Some((name, value)) = agent.resolve_api_key() {
            env.insert(name, value);
        }
        let cwd = agent
            .cwd
            .as_ref()
            .map_or_else(|| self.root.clone(), |c| paths::resolve(&self.root, c));
        QueryOptions {
            model: Some(agent.model.clone()),
            max_turns: Some(agent.max_turns),
            permission_mode: agent.permission_mode,
            cwd: Some(cwd),
            env,
            path_to_executable: agent.cli_path.clone(),
            ..QueryOptions::default()
        }
    }

    /// Run one prompt. The target is a result record without an error flag.
    pub async fn ask(&self, agent_name: &str, prompt: String, timeout: Duration) -> SdkResult<Message> {
        let source = self.transport.source(prompt, self.query_options());
        self.executor
            .execute(
                source,
                TargetPredicate::successful_result(),
                ExecuteOptions::new(agent_name, timeout),
            )
            .await
    }
}

/// Scalar payload of the target result record.
pub fn result_text(result: &SdkResult<Message>) -> Option<&str> {
    result
        .target_message()
        .and_then(Message::as_result)
        .and_then(|r| r.text())
}
