//! Error types for the wire transport.

/// Errors produced by the TCP wire layer.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("connection timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server reported an internal failure for this request.
    #[error("server error: {0}")]
    Remote(String),
}
