//! Pre-flight status check: classify a session before any dispatch.
//!
//! This is the mechanism that prevents duplicate work — a file the
//! server already holds never dispatches a single chunk, and a
//! partially stored file only dispatches the missing ones.

use chunkferry_protocol::{StatusKind, StatusRequest};
use tracing::{debug, warn};

use crate::TransferError;
use crate::session::UploadSession;
use crate::state::{SessionEvent, SessionState};
use crate::transport::ChunkTransport;

/// Classification of a session after the pre-flight query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusOutcome {
    /// The server holds the assembled file.
    Complete,
    /// The server holds these chunk indices.
    InProgress(Vec<u32>),
    /// Unknown file — upload everything.
    NotFound,
}

/// Queries the server once for a session's stored state.
///
/// A transport failure degrades to `NotFound` by policy: the upload
/// proceeds optimistically and any duplicate chunks are caught by
/// server-side rejection. The failure is logged, not silent.
pub async fn check_session(
    transport: &dyn ChunkTransport,
    session: &UploadSession,
) -> StatusOutcome {
    let request = StatusRequest {
        file_id: session.file_id(),
        file_name: session.file_name(),
    };

    match transport.check_status(request).await {
        Ok(response) => match response.status {
            StatusKind::Complete => StatusOutcome::Complete,
            StatusKind::InProgress => StatusOutcome::InProgress(response.confirmed_chunks),
            StatusKind::NotFound => StatusOutcome::NotFound,
        },
        Err(e) => {
            warn!(
                file = %session.file_name(),
                error = %e,
                "status check failed, proceeding as not found"
            );
            StatusOutcome::NotFound
        }
    }
}

/// Applies a status outcome to a session in `Checking` state: seeds
/// confirmed chunks and advances the state machine. Returns the new
/// state (`AlreadyComplete` or `Uploading`).
pub fn apply_outcome(
    session: &UploadSession,
    outcome: StatusOutcome,
) -> Result<SessionState, TransferError> {
    match outcome {
        StatusOutcome::Complete => {
            session.seed_all_confirmed();
            let state = session.apply(SessionEvent::StatusComplete)?;
            debug!(file = %session.file_name(), "already complete on server");
            Ok(state)
        }
        StatusOutcome::InProgress(confirmed) => {
            debug!(
                file = %session.file_name(),
                confirmed = confirmed.len(),
                "resuming partial upload"
            );
            session.seed_confirmed(&confirmed);
            session.apply(SessionEvent::StatusPartialOrNotFound)
        }
        StatusOutcome::NotFound => session.apply(SessionEvent::StatusPartialOrNotFound),
    }
}
