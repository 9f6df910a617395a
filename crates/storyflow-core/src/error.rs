use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("state store lock not acquired within {0:?}")]
    LockTimeout(Duration),

    #[error("state store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("background task failed: {0}")]
    TaskJoin(String),

    #[error("epic '{path}' could not be parsed: {reason}")]
    EpicParse { path: String, reason: String },

    #[error("story document not found: {0}")]
    StoryNotFound(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("run cancelled by operator")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
