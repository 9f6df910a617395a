use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed stream-json line: {source}\n  line: {line}")]
    Parse {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("claude CLI not found at '{0}'")]
    ExecutableNotFound(String),

    #[error("process error: {0}")]
    Process(String),
}

impl StreamError {
    /// True when the failure came from the subprocess boundary (spawn, exit
    /// code, pipes) rather than from the payload.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            StreamError::Io(_) | StreamError::ExecutableNotFound(_) | StreamError::Process(_)
        )
    }
}
