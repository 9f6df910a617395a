use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

// ─── Message ──────────────────────────────────────────────────────────────

/// One JSONL record emitted by `claude --output-format stream-json`,
/// discriminated by its `"type"` field.
///
/// Record types the workflow does not consume (rate limit events, partial
/// chunks, tool progress) all land in [`Message::Other`].
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    System(SystemMessage),
    Assistant(AssistantMessage),
    User(UserMessage),
    Result(ResultMessage),
    #[serde(other)]
    Other,
}

impl Message {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Message::System(m) => m.session_id.as_deref(),
            Message::Assistant(m) => m.session_id.as_deref(),
            Message::User(m) => m.session_id.as_deref(),
            Message::Result(m) => Some(m.session_id.as_str()),
            Message::Other => None,
        }
    }

    pub fn as_result(&self) -> Option<&ResultMessage> {
        match self {
            Message::Result(r) => Some(r),
            _ => None,
        }
    }

    /// Concatenated text blocks of an assistant message.
    pub fn assistant_text(&self) -> Option<String> {
        let Message::Assistant(a) = self else {
            return None;
        };
        let text: Vec<&str> = a
            .message
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if text.is_empty() {
            None
        } else {
            Some(text.join("\n"))
        }
    }
}

// ─── system ───────────────────────────────────────────────────────────────

/// `type = "system"`. Only the subtype and session id are interpreted.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemMessage {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, alias = "permissionMode")]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

// ─── assistant / user ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantMessage {
    pub message: AssistantBody,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AssistantBody {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    Thinking {
        thinking: String,
    },
    #[serde(other)]
    Other,
}

/// `type = "user"`: tool results fed back to the model. The payload is
/// kept opaque.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserMessage {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message: serde_json::Value,
}

// ─── result ───────────────────────────────────────────────────────────────

/// `type = "result"`: the terminal record of every query.
///
/// `subtype` is `success` or one of the `error_*` variants; the scalar
/// payload is only present on success.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResultMessage {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ResultMessage {
    /// A result counts as an error when the flag is set or the subtype is
    /// anything other than `success`.
    pub fn is_error(&self) -> bool {
        self.is_error || self.subtype != "success"
    }

    pub fn text(&self) -> Option<&str> {
        if self.is_error() {
            None
        } else {
            self.result.as_deref()
        }
    }

    /// Build a successful result record; used by offline transports.
    pub fn success(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            subtype: "success".into(),
            session_id: session_id.into(),
            is_error: false,
            result: Some(text.into()),
            num_turns: 1,
            duration_ms: 0,
            total_cost_usd: Some(0.0),
            errors: Vec::new(),
        }
    }
}

// ─── QueryOptions ─────────────────────────────────────────────────────────

/// Options for one CLI invocation.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub permission_mode: PermissionMode,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    /// Working directory for the subprocess (default: current dir).
    pub cwd: Option<PathBuf>,
    /// Extra environment for the subprocess, e.g. forwarded credentials.
    pub env: HashMap<String, String>,
    /// Path to the `claude` binary (default: `"claude"` on `PATH`).
    pub path_to_executable: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
            PermissionMode::Plan => "plan",
        }
    }
}
