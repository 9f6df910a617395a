use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::source::SourceError;

/// Outcome classification of one SDK call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SdkErrorKind {
    Success,
    Cancelled,
    Timeout,
    SdkError,
    CancelScopeError,
    Unknown,
}

impl SdkErrorKind {
    pub fn all() -> &'static [SdkErrorKind] {
        &[
            SdkErrorKind::Success,
            SdkErrorKind::Cancelled,
            SdkErrorKind::Timeout,
            SdkErrorKind::SdkError,
            SdkErrorKind::CancelScopeError,
            SdkErrorKind::Unknown,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SdkErrorKind::Success => "success",
            SdkErrorKind::Cancelled => "cancelled",
            SdkErrorKind::Timeout => "timeout",
            SdkErrorKind::SdkError => "sdk_error",
            SdkErrorKind::CancelScopeError => "cancel_scope_error",
            SdkErrorKind::Unknown => "unknown",
        }
    }

    /// Map a source failure onto a kind.
    pub fn classify(error: &SourceError) -> Self {
        match error {
            SourceError::Transport(_) => SdkErrorKind::SdkError,
            SourceError::ScopeViolation(_) => SdkErrorKind::CancelScopeError,
            SourceError::Panicked(_) | SourceError::Other(_) => SdkErrorKind::Unknown,
        }
    }
}

impl fmt::Display for SdkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about one finished SDK call.
#[derive(Debug)]
pub struct SdkResult<M> {
    pub has_target_result: bool,
    pub cleanup_completed: bool,
    pub duration: Duration,
    pub session_id: Option<String>,
    pub agent_name: String,
    pub messages: Vec<M>,
    target_index: Option<usize>,
    pub error_kind: SdkErrorKind,
    pub errors: Vec<String>,
    pub last_error: Option<SourceError>,
}

impl<M> SdkResult<M> {
    pub(crate) fn new(agent_name: &str) -> Self {
        Self {
            has_target_result: false,
            cleanup_completed: false,
            duration: Duration::ZERO,
            session_id: None,
            agent_name: agent_name.to_string(),
            messages: Vec::new(),
            target_index: None,
            error_kind: SdkErrorKind::Unknown,
            errors: Vec::new(),
            last_error: None,
        }
    }

    /// True only when the target message was observed and the source has
    /// been fully cleaned up. Nothing else counts as success.
    pub fn success(&self) -> bool {
        self.has_target_result && self.cleanup_completed
    }

    /// The message that satisfied the target predicate.
    pub fn target_message(&self) -> Option<&M> {
        self.target_index.and_then(|i| self.messages.get(i))
    }

    pub fn into_target(mut self) -> Option<M> {
        let index = self.target_index?;
        if index < self.messages.len() {
            Some(self.messages.swap_remove(index))
        } else {
            None
        }
    }

    pub(crate) fn push_message(&mut self, message: M, is_target: bool) {
        if is_target && self.target_index.is_none() {
            self.target_index = Some(self.messages.len());
            self.has_target_result = true;
        }
        self.messages.push(message);
    }

    pub(crate) fn fail(&mut self, kind: SdkErrorKind, message: impl Into<String>) {
        self.error_kind = kind;
        self.errors.push(message.into());
    }

    /// Short human summary, used in run logs.
    pub fn summary(&self) -> String {
        if self.success() {
            format!("{} ok in {:.1}s", self.agent_name, self.duration.as_secs_f64())
        } else {
            format!(
                "{} failed ({}) in {:.1}s: {}",
                self.agent_name,
                self.error_kind,
                self.duration.as_secs_f64(),
                self.errors.last().map(String::as_str).unwrap_or("no target result"),
            )
        }
    }
}
