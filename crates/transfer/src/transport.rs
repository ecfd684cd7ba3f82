//! Transport abstraction: one chunk exchange per call, no retries.
//!
//! `ChunkTransport` is implemented by real transports (see
//! `chunkferry-wire`) and by test mocks. Using a trait keeps the
//! scheduler decoupled from the wire and testable without a server.

use std::future::Future;
use std::pin::Pin;

use chunkferry_protocol::{ChunkAck, ChunkHeader, RejectReason, StatusRequest, StatusResponse};

/// Errors from a single transport exchange.
///
/// `Network` and `ServerUnavailable` are transient — the scheduler
/// retries them within the chunk's attempt budget. `Rejected` is
/// permanent for that chunk and fails the session immediately.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("server rejected chunk: {0}")]
    Rejected(RejectReason),
}

impl TransportError {
    /// True when the scheduler may retry the attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::ServerUnavailable(_))
    }
}

/// Abstract connection to a chunk server.
///
/// Each method performs exactly one attempt; the transport holds no
/// retry state. Boxed futures keep the trait object-safe so the
/// scheduler can hold `Arc<dyn ChunkTransport>`.
pub trait ChunkTransport: Send + Sync {
    /// Uploads one chunk's bytes and interprets the response.
    ///
    /// A rejected ack must surface as [`TransportError::Rejected`],
    /// never as an `Ok` value.
    fn send_chunk(
        &self,
        header: ChunkHeader,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<ChunkAck, TransportError>> + Send + '_>>;

    /// Asks the server what it holds for a file.
    fn check_status(
        &self,
        request: StatusRequest,
    ) -> Pin<Box<dyn Future<Output = Result<StatusResponse, TransportError>> + Send + '_>>;
}
