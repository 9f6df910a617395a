use crate::error::{FlowError, Result};
use crate::paths;
use claude_stream::PermissionMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// AgentConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_permission_mode")]
    pub permission_mode: PermissionMode,
    /// Path to the `claude` binary; `PATH` lookup when unset.
    #[serde(default)]
    pub cli_path: Option<String>,
    /// Working directory for agent calls; the project root when unset.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Credential variables, checked in order; the first one set wins.
    #[serde(default = "default_api_key_vars")]
    pub api_key_vars: Vec<String>,
}

fn default_model() -> String {
    "claude-sonnet-4-6".to_string()
}

fn default_permission_mode() -> PermissionMode {
    PermissionMode::BypassPermissions
}

fn default_max_turns() -> u32 {
    200
}

fn default_api_key_vars() -> Vec<String> {
    vec![
        "ANTHROPIC_API_KEY".to_string(),
        "CLAUDE_API_KEY".to_string(),
        "CLAUDE_CODE_OAUTH_TOKEN".to_string(),
    ]
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            permission_mode: default_permission_mode(),
            cli_path: None,
            cwd: None,
            max_turns: default_max_turns(),
            api_key_vars: default_api_key_vars(),
        }
    }
}

impl AgentConfig {
    /// First credential variable that is set and non-empty, as
    /// `(variable name, value)`.
    pub fn resolve_api_key(&self) -> Option<(String, String)> {
        self.api_key_vars.iter().find_map(|name| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(|v| (name.clone(), v))
        })
    }
}

// ---------------------------------------------------------------------------
// WorkflowConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Dev–QA rounds per story run.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// Extra passes over failed stories after the first pass of an epic.
    #[serde(default = "default_story_retries")]
    pub story_retries: u32,
    /// Stories processed at once. `1` keeps the run strictly sequential.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_max_rounds() -> u32 {
    3
}

fn default_story_retries() -> u32 {
    1
}

fn default_concurrency() -> usize {
    1
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            story_retries: default_story_retries(),
            concurrency: default_concurrency(),
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutConfig
// ---------------------------------------------------------------------------

/// Wall-clock budgets in seconds, enforced inside the SDK execution layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_scrum_master_secs")]
    pub scrum_master_secs: u64,
    #[serde(default = "default_state_parser_secs")]
    pub state_parser_secs: u64,
    #[serde(default = "default_developer_secs")]
    pub developer_secs: u64,
    #[serde(default = "default_qa_secs")]
    pub qa_secs: u64,
    #[serde(default = "default_status_update_secs")]
    pub status_update_secs: u64,
    #[serde(default = "default_fix_secs")]
    pub fix_secs: u64,
    #[serde(default = "default_tool_secs")]
    pub tool_secs: u64,
}

fn default_scrum_master_secs() -> u64 {
    1800
}
fn default_state_parser_secs() -> u64 {
    120
}
fn default_developer_secs() -> u64 {
    3600
}
fn default_qa_secs() -> u64 {
    1800
}
fn default_status_update_secs() -> u64 {
    300
}
fn default_fix_secs() -> u64 {
    1800
}
fn default_tool_secs() -> u64 {
    900
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            scrum_master_secs: default_scrum_master_secs(),
            state_parser_secs: default_state_parser_secs(),
            developer_secs: default_developer_secs(),
            qa_secs: default_qa_secs(),
            status_update_secs: default_status_update_secs(),
            fix_secs: default_fix_secs(),
            tool_secs: default_tool_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn scrum_master(&self) -> Duration {
        Duration::from_secs(self.scrum_master_secs)
    }
    pub fn state_parser(&self) -> Duration {
        Duration::from_secs(self.state_parser_secs)
    }
    pub fn developer(&self) -> Duration {
        Duration::from_secs(self.developer_secs)
    }
    pub fn qa(&self) -> Duration {
        Duration::from_secs(self.qa_secs)
    }
    pub fn status_update(&self) -> Duration {
        Duration::from_secs(self.status_update_secs)
    }
    pub fn fix(&self) -> Duration {
        Duration::from_secs(self.fix_secs)
    }
    pub fn tool(&self) -> Duration {
        Duration::from_secs(self.tool_secs)
    }
}

// ---------------------------------------------------------------------------
// QualityConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityToolKind {
    Ruff,
    Basedpyright,
}

impl QualityToolKind {
    /// Executable looked up on `PATH`.
    pub fn program(self) -> &'static str {
        match self {
            QualityToolKind::Ruff => "ruff",
            QualityToolKind::Basedpyright => "basedpyright",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    #[serde(default = "default_cycles")]
    pub max_cycles: u32,
    /// Pause before every fix call to let the upstream agent cool down.
    #[serde(default = "default_sdk_call_delay")]
    pub sdk_call_delay_secs: u64,
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,
    #[serde(default = "default_tools")]
    pub tools: Vec<QualityToolKind>,
}

fn default_cycles() -> u32 {
    3
}

fn default_sdk_call_delay() -> u64 {
    60
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("src")
}

fn default_tools() -> Vec<QualityToolKind> {
    vec![QualityToolKind::Basedpyright, QualityToolKind::Ruff]
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            max_cycles: default_cycles(),
            sdk_call_delay_secs: default_sdk_call_delay(),
            source_dir: default_source_dir(),
            tools: default_tools(),
        }
    }
}

impl QualityConfig {
    pub fn sdk_call_delay(&self) -> Duration {
        Duration::from_secs(self.sdk_call_delay_secs)
    }
}

// ---------------------------------------------------------------------------
// TestConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfig {
    #[serde(default = "default_cycles")]
    pub max_cycles: u32,
    #[serde(default = "default_retries_per_cycle")]
    pub retries_per_cycle: u32,
    /// Consecutive failures of one test before the remote-debug path.
    #[serde(default = "default_debug_threshold")]
    pub debug_threshold: u32,
    #[serde(default = "default_test_dir")]
    pub test_dir: PathBuf,
    #[serde(default = "default_sdk_call_delay")]
    pub sdk_call_delay_secs: u64,
}

fn default_retries_per_cycle() -> u32 {
    2
}

fn default_debug_threshold() -> u32 {
    5
}

fn default_test_dir() -> PathBuf {
    PathBuf::from("tests")
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            max_cycles: default_cycles(),
            retries_per_cycle: default_retries_per_cycle(),
            debug_threshold: default_debug_threshold(),
            test_dir: default_test_dir(),
            sdk_call_delay_secs: default_sdk_call_delay(),
        }
    }
}

impl TestConfig {
    pub fn sdk_call_delay(&self) -> Duration {
        Duration::from_secs(self.sdk_call_delay_secs)
    }
}

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Substrings marking story paths left behind by test runs or scratch
    /// directories. Matching records are purged at epic start.
    #[serde(default = "default_transient_markers")]
    pub transient_markers: Vec<String>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(paths::DEFAULT_DB_FILE)
}

fn default_pool_size() -> usize {
    5
}

fn default_lock_timeout() -> u64 {
    30
}

fn default_retention_days() -> u32 {
    30
}

fn default_transient_markers() -> Vec<String> {
    vec![
        "/tmp/".to_string(),
        "/temp/".to_string(),
        "pytest-of-".to_string(),
        "test_story".to_string(),
    ]
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            pool_size: default_pool_size(),
            lock_timeout_secs: default_lock_timeout(),
            retention_days: default_retention_days(),
            transient_markers: default_transient_markers(),
        }
    }
}

impl StoreConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// PathsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_stories_dir")]
    pub stories_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_stories_dir() -> PathBuf {
    PathBuf::from(paths::DEFAULT_STORIES_DIR)
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(paths::DEFAULT_LOG_DIR)
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            stories_dir: default_stories_dir(),
            log_dir: default_log_dir(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub tests: TestConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

impl Config {
    /// Load `.storyflow/config.yaml`, falling back to defaults when the file
    /// does not exist.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Config::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let config: Config = serde_yaml::from_str(&data)?;
        Ok(config)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&paths::config_path(root), data.as_bytes())
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };
        if self.workflow.max_rounds == 0 {
            error("workflow.max_rounds must be at least 1".into());
        }
        if self.workflow.concurrency == 0 {
            error("workflow.concurrency must be at least 1".into());
        }
        if self.store.pool_size == 0 {
            error("store.pool_size must be at least 1".into());
        }
        if self.store.lock_timeout_secs == 0 {
            error("store.lock_timeout_secs must be greater than zero".into());
        }
        if self.quality.max_cycles == 0 {
            error("quality.max_cycles must be at least 1".into());
        }
        if self.tests.max_cycles == 0 || self.tests.retries_per_cycle == 0 {
            error("tests.max_cycles and tests.retries_per_cycle must be at least 1".into());
        }

        if self.quality.sdk_call_delay_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "quality.sdk_call_delay_secs is 0; fix calls will hit the agent back to back"
                    .into(),
            });
        }
        if self.workflow.concurrency > 1 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "workflow.concurrency = {}; stories run without ordering guarantees",
                    self.workflow.concurrency
                ),
            });
        }
        if self.agent.resolve_api_key().is_none() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "none of {} is set; the claude CLI must be logged in on its own",
                    self.agent.api_key_vars.join(", ")
                ),
            });
        }
        warnings
    }

    /// Fail on the first error-level warning.
    pub fn ensure_valid(&self) -> Result<()> {
        match self
            .validate()
            .into_iter()
            .find(|w| w.level == WarnLevel::Error)
        {
            Some(w) => Err(FlowError::Config(w.message)),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
