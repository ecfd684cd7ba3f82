//! Session lifecycle as an explicit table-driven state machine.
//!
//! The lifecycle is externally observable — UI layers render it — so
//! transitions are restricted to a fixed table and everything else is
//! a programming error surfaced as `IllegalTransition`.

use serde::Serialize;

/// Externally observable state of one upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Built, nothing dispatched yet.
    Idle,
    /// Pre-flight status query in flight.
    Checking,
    /// The server already holds the whole file. Terminal.
    AlreadyComplete,
    /// Chunks are being dispatched.
    Uploading,
    /// User paused; in-flight chunks drain, no new dispatch.
    Paused,
    /// A chunk exhausted its retries (or was permanently rejected).
    /// Recoverable: resume resets failed chunks.
    Failed,
    /// Every chunk is done. Terminal.
    Completed,
}

impl SessionState {
    /// True for states that can never be left.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::AlreadyComplete | Self::Completed)
    }
}

/// Events driving [`SessionState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    StatusCheckStarted,
    StatusComplete,
    StatusPartialOrNotFound,
    PauseRequested,
    ResumeRequested,
    AllChunksDone,
    ChunkExhaustedRetries,
}

/// The transition table. Returns `None` for illegal pairs.
pub fn transition(state: SessionState, event: SessionEvent) -> Option<SessionState> {
    use SessionEvent as E;
    use SessionState as S;
    match (state, event) {
        (S::Idle, E::StatusCheckStarted) => Some(S::Checking),
        (S::Checking, E::StatusComplete) => Some(S::AlreadyComplete),
        (S::Checking, E::StatusPartialOrNotFound) => Some(S::Uploading),
        (S::Uploading, E::PauseRequested) => Some(S::Paused),
        (S::Uploading, E::AllChunksDone) => Some(S::Completed),
        (S::Uploading, E::ChunkExhaustedRetries) => Some(S::Failed),
        (S::Paused, E::ResumeRequested) => Some(S::Uploading),
        (S::Failed, E::ResumeRequested) => Some(S::Uploading),
        _ => None,
    }
}
