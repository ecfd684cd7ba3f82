//! Resumable chunked upload engine.
//!
//! This crate implements the **upload coordination logic** for sending
//! large files to a chunk server: fixed-size chunking, a bounded pool
//! of concurrent chunk uploads, per-chunk retry with exponential
//! backoff, pause/resume without re-sending completed chunks, and a
//! pre-flight status check that skips files the server already holds.
//!
//! It is a library crate with no UI or transport dependencies — a
//! caller provides a [`ChunkTransport`] implementation (see
//! `chunkferry-wire` for the TCP one) and consumes [`UploadEvent`]s.
//!
//! # Pipeline per file
//!
//! 1. **Build** — partition the file into chunks, derive a stable id
//! 2. **Check** — ask the server: complete / partial / unknown
//! 3. **Schedule** — dispatch pending chunks into the shared pool
//! 4. **Retry** — requeue transient failures with backoff
//! 5. **Complete** — emit a single completion event

pub mod chunk;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod status;
pub mod transport;

pub use chunk::{Chunk, ChunkStatus, chunk_layout};
pub use retry::RetryPolicy;
pub use scheduler::{Scheduler, SchedulerHandle, UploadEvent};
pub use session::{UploadSession, checksum_bytes, derive_file_id};
pub use state::{SessionEvent, SessionState};
pub use status::{StatusOutcome, apply_outcome, check_session};
pub use transport::{ChunkTransport, TransportError};

/// Default chunk size: 8 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Default bound on concurrently in-flight chunk uploads, shared
/// across all sessions.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("empty file: {0}")]
    EmptyFile(String),

    #[error("invalid chunk transition for chunk {index}: {from:?} -> {to:?}")]
    InvalidTransition {
        index: u32,
        from: ChunkStatus,
        to: ChunkStatus,
    },

    #[error("illegal session transition: {state:?} on {event:?}")]
    IllegalTransition {
        state: SessionState,
        event: SessionEvent,
    },

    #[error("chunk index {index} out of range (total {total})")]
    ChunkOutOfRange { index: u32, total: u32 },

    #[error("scheduler stopped")]
    SchedulerStopped,
}

/// Configuration for the upload engine.
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Bytes per chunk.
    pub chunk_size: u64,
    /// Bound on concurrently in-flight chunks across all sessions.
    pub max_concurrent_uploads: usize,
    /// Per-chunk retry/backoff policy.
    pub retry: RetryPolicy,
    /// Whether to run the pre-flight status check. Disabled, every
    /// session goes straight to uploading all chunks.
    pub status_check_enabled: bool,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_uploads: DEFAULT_MAX_CONCURRENT,
            retry: RetryPolicy::default(),
            status_check_enabled: true,
        }
    }
}

impl UploaderConfig {
    /// Clamps nonsensical values to workable minimums.
    pub fn sanitized(mut self) -> Self {
        if self.chunk_size == 0 {
            self.chunk_size = DEFAULT_CHUNK_SIZE;
        }
        if self.max_concurrent_uploads == 0 {
            self.max_concurrent_uploads = 1;
        }
        if self.retry.max_attempts == 0 {
            self.retry.max_attempts = 1;
        }
        self
    }
}
