use std::time::Duration;

/// Result type for socket operations
pub type SocketResult<T> = Result<T, SocketError>;

/// Socket layer error types
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("Malformed frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Correlation id already pending: {0}")]
    DuplicateCorrelationId(String),

    #[error("No pending request for response: {0}")]
    UnmatchedResponse(String),

    #[error("Request {cmd_idx} timed out after {elapsed:?}")]
    Timeout { cmd_idx: String, elapsed: Duration },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Write failed: {0}")]
    WriteFailure(#[from] std::io::Error),

    #[error("Message is not a request: msgType={0}")]
    NotARequest(String),

    #[error("Too many pending requests ({0})")]
    TooManyPending(usize),

    #[error("Worker pool saturated, request rejected")]
    PoolSaturated,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl SocketError {
    /// Whether the connection can no longer be used after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, SocketError::ConnectionClosed | SocketError::WriteFailure(_))
    }
}
