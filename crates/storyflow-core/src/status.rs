use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::FlowError;

// ---------------------------------------------------------------------------
// ProcessingStatus
// ---------------------------------------------------------------------------

/// Store-side status of a story. The state store is the only place this
/// value lives; the story document carries a derived [`DocumentStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    InProgress,
    Review,
    Completed,
    Cancelled,
    Error,
}

impl ProcessingStatus {
    pub fn all() -> &'static [ProcessingStatus] {
        &[
            ProcessingStatus::InProgress,
            ProcessingStatus::Review,
            ProcessingStatus::Completed,
            ProcessingStatus::Cancelled,
            ProcessingStatus::Error,
        ]
    }

    /// Statuses the controllers are allowed to write through
    /// `update_processing_status`.
    pub fn controller_writable() -> &'static [ProcessingStatus] {
        &[
            ProcessingStatus::InProgress,
            ProcessingStatus::Review,
            ProcessingStatus::Completed,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStatus::InProgress => "in_progress",
            ProcessingStatus::Review => "review",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Cancelled => "cancelled",
            ProcessingStatus::Error => "error",
        }
    }

    /// Lenient decoding for values read back from the database: anything
    /// unrecognised is treated as `in_progress`.
    pub fn from_db(raw: &str) -> Self {
        raw.parse().unwrap_or_else(|_| {
            tracing::warn!(status = raw, "unknown processing status, reading as in_progress");
            ProcessingStatus::InProgress
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessingStatus::Completed | ProcessingStatus::Cancelled | ProcessingStatus::Error
        )
    }

    /// The Status text the story document should carry for this record.
    pub fn document_status(self) -> DocumentStatus {
        match self {
            ProcessingStatus::InProgress => DocumentStatus::ReadyForDevelopment,
            ProcessingStatus::Review => DocumentStatus::ReadyForReview,
            ProcessingStatus::Completed => DocumentStatus::ReadyForDone,
            ProcessingStatus::Cancelled | ProcessingStatus::Error => {
                DocumentStatus::ReadyForDevelopment
            }
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(ProcessingStatus::InProgress),
            "review" => Ok(ProcessingStatus::Review),
            "completed" => Ok(ProcessingStatus::Completed),
            "cancelled" => Ok(ProcessingStatus::Cancelled),
            "error" => Ok(ProcessingStatus::Error),
            _ => Err(FlowError::InvalidArgument(format!(
                "unknown processing status '{s}'"
            ))),
        }
    }
}

/// Map a raw processing-status string to the document status, defaulting
/// unknown values to "Ready for Development".
pub fn document_status_for(raw: &str) -> DocumentStatus {
    match raw.parse::<ProcessingStatus>() {
        Ok(p) => p.document_status(),
        Err(_) => DocumentStatus::ReadyForDevelopment,
    }
}

// ---------------------------------------------------------------------------
// DocumentStatus
// ---------------------------------------------------------------------------

/// Canonical text of the Status section in a story document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentStatus {
    Start,
    Draft,
    ReadyForDevelopment,
    InProgress,
    ReadyForReview,
    ReadyForDone,
    Done,
    Failed,
    Error,
}

impl DocumentStatus {
    pub fn all() -> &'static [DocumentStatus] {
        &[
            DocumentStatus::Start,
            DocumentStatus::Draft,
            DocumentStatus::ReadyForDevelopment,
            DocumentStatus::InProgress,
            DocumentStatus::ReadyForReview,
            DocumentStatus::ReadyForDone,
            DocumentStatus::Done,
            DocumentStatus::Failed,
            DocumentStatus::Error,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Start => "Start",
            DocumentStatus::Draft => "Draft",
            DocumentStatus::ReadyForDevelopment => "Ready for Development",
            DocumentStatus::InProgress => "In Progress",
            DocumentStatus::ReadyForReview => "Ready for Review",
            DocumentStatus::ReadyForDone => "Ready for Done",
            DocumentStatus::Done => "Done",
            DocumentStatus::Failed => "Failed",
            DocumentStatus::Error => "Error",
        }
    }

    /// Parse document text. Case, surrounding markup (`**`, backticks) and
    /// runs of whitespace are ignored; `-` and `_` count as spaces.
    pub fn parse(text: &str) -> Option<Self> {
        let normalized: String = text
            .trim()
            .trim_matches(|c: char| c == '*' || c == '`' || c == '_' || c == '"')
            .chars()
            .map(|c| if c == '-' || c == '_' { ' ' } else { c })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        DocumentStatus::all()
            .iter()
            .copied()
            .find(|s| s.as_str().to_lowercase() == normalized)
    }

    /// Story finished from the Dev–QA loop's point of view.
    pub fn is_done(self) -> bool {
        matches!(self, DocumentStatus::Done | DocumentStatus::ReadyForDone)
    }

    /// States that send the story to the Developer agent.
    pub fn needs_development(self) -> bool {
        matches!(
            self,
            DocumentStatus::Draft
                | DocumentStatus::Failed
                | DocumentStatus::ReadyForDevelopment
                | DocumentStatus::InProgress
        )
    }

    /// Inverse of [`ProcessingStatus::document_status`] where it is defined.
    pub fn processing_status(self) -> Option<ProcessingStatus> {
        match self {
            DocumentStatus::ReadyForDevelopment => Some(ProcessingStatus::InProgress),
            DocumentStatus::ReadyForReview => Some(ProcessingStatus::Review),
            DocumentStatus::ReadyForDone => Some(ProcessingStatus::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
