use claude_stream::{Message, QueryOptions, ResultMessage};

use crate::sdk::MessageSource;

/// Reply the dry-run transport gives to every prompt. It carries a passing
/// QA verdict so a dry run walks every story to completion.
pub const DRY_RUN_REPLY: &str = "Dry run: no agent was called.\nVERDICT: PASS";

/// Produces the message stream for one prompt.
pub trait AgentTransport: Send + Sync {
    fn name(&self) -> &'static str;

    fn source(&self, prompt: String, opts: QueryOptions) -> MessageSource<Message>;
}

/// The `claude` CLI in stream-json mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClaudeCliTransport;

impl AgentTransport for ClaudeCliTransport {
    fn name(&self) -> &'static str {
        "claude-cli"
    }

    fn source(&self, prompt: String, opts: QueryOptions) -> MessageSource<Message> {
        MessageSource::claude(prompt, opts)
    }
}

/// Answers every prompt with a successful result record without starting
/// a process.
#[derive(Debug, Clone)]
pub struct DryRunTransport {
    reply: String,
}

impl Default for DryRunTransport {
    fn default() -> Self {
        Self::new(DRY_RUN_REPLY)
    }
}

impl DryRunTransport {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
        }
    }
}

impl AgentTransport for DryRunTransport {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    fn source(&self, prompt: String, _opts: QueryOptions) -> MessageSource<Message> {
        tracing::debug!(chars = prompt.len(), "dry-run prompt");
        MessageSource::from_items(vec![Ok(Message::Result(ResultMessage::success(
            "dry-run",
            self.reply.clone(),
        )))])
    }
}
