use serde::{Deserialize, Serialize};

/// Classification of a file's server-side upload state.
///
/// Serialized snake_case (`complete`, `in_progress`, `not_found`) to
/// stay readable in diagnostics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// The assembled file already exists on the server.
    Complete,
    /// Some chunks are stored; the response lists which.
    InProgress,
    /// The server has never seen this file identifier.
    NotFound,
}

/// Reason a server refused a chunk. All of these are permanent for the
/// offending chunk — the client must not retry blindly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[error("chunk checksum mismatch")]
    ChecksumMismatch,
    #[error("file identifier conflict")]
    IdentifierConflict,
    #[error("server storage error")]
    StorageError,
    #[error("authentication rejected")]
    Unauthorized,
}
