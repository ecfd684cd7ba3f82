//! Upload scheduler: one event loop coordinating every session.
//!
//! The scheduler owns a bounded pool of concurrently in-flight chunk
//! uploads shared across all sessions — one global bound, not one per
//! file, so total network usage stays fixed no matter how many files
//! are queued. All chunk and session mutation is serialized through a
//! single `tokio::select!` loop; worker tasks only ever report
//! outcomes over a channel, so the slot count is the sole piece of
//! contended state.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chunkferry_protocol::{ChunkAck, ChunkHeader};

use crate::session::{UploadSession, checksum_bytes};
use crate::state::{SessionEvent, SessionState};
use crate::status::{self, StatusOutcome};
use crate::transport::{ChunkTransport, TransportError};
use crate::{TransferError, UploaderConfig};

/// Event emitted to the UI-facing consumer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum UploadEvent {
    /// The session lifecycle moved.
    StateChanged {
        file_id: String,
        state: SessionState,
    },
    /// Aggregate progress after a chunk status change, in `[0, 1]`.
    Progress { file_id: String, progress: f64 },
    /// A chunk failed permanently (retries exhausted or rejected).
    /// Transient failures are absorbed by the retry loop and never
    /// surface here.
    ChunkFailed {
        file_id: String,
        chunk_index: u32,
        error: String,
    },
    /// Every chunk of the session is done. Emitted exactly once.
    Completed { file_id: String },
}

/// Commands accepted by the scheduler loop.
enum Command {
    AddSession(Arc<UploadSession>),
    Pause(String),
    Resume(String),
    Remove(String),
    Shutdown,
}

/// Cloneable handle for driving a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    /// Queues a freshly built session for upload.
    pub async fn add_session(&self, session: Arc<UploadSession>) -> Result<(), TransferError> {
        self.send(Command::AddSession(session)).await
    }

    /// Stops new dispatch for a session; in-flight chunks drain.
    pub async fn pause(&self, file_id: &str) -> Result<(), TransferError> {
        self.send(Command::Pause(file_id.to_string())).await
    }

    /// Resumes a paused or failed session. Failed chunks are reset to
    /// pending with a fresh attempt budget; done chunks are never
    /// re-sent.
    pub async fn resume(&self, file_id: &str) -> Result<(), TransferError> {
        self.send(Command::Resume(file_id.to_string())).await
    }

    /// Drops a session from the active set.
    pub async fn remove(&self, file_id: &str) -> Result<(), TransferError> {
        self.send(Command::Remove(file_id.to_string())).await
    }

    /// Stops the scheduler loop.
    pub async fn shutdown(&self) -> Result<(), TransferError> {
        self.send(Command::Shutdown).await
    }

    async fn send(&self, cmd: Command) -> Result<(), TransferError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| TransferError::SchedulerStopped)
    }
}

/// Coordinates chunk uploads for any number of sessions.
///
/// Construct one explicitly and pass its [`SchedulerHandle`] around —
/// there is no global instance, so independent upload contexts can
/// coexist and tear down cleanly.
pub struct Scheduler {
    transport: Arc<dyn ChunkTransport>,
    config: UploaderConfig,
    commands_tx: mpsc::Sender<Command>,
    commands_rx: mpsc::Receiver<Command>,
    events_tx: mpsc::Sender<UploadEvent>,
    events_rx: Option<mpsc::Receiver<UploadEvent>>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Creates a scheduler over the given transport.
    pub fn new(transport: Arc<dyn ChunkTransport>, config: UploaderConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            transport,
            config: config.sanitized(),
            commands_tx,
            commands_rx,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Returns a handle for queueing sessions and pause/resume.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            commands: self.commands_tx.clone(),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events_rx.take()
    }

    /// Returns a cancellation token that stops the loop when fired.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the scheduler loop until shutdown or cancellation.
    pub async fn run(self) {
        let Scheduler {
            transport,
            config,
            commands_tx: _commands_tx,
            mut commands_rx,
            events_tx,
            events_rx: _,
            cancel,
        } = self;

        let (worker_tx, mut worker_rx) = mpsc::unbounded_channel();
        let ctx = LoopCtx {
            transport,
            config,
            events_tx,
            worker_tx,
        };

        let mut sessions: Vec<Weak<UploadSession>> = Vec::new();
        let mut in_flight = 0usize;

        loop {
            in_flight += dispatch_ready(&ctx, &mut sessions, in_flight);

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scheduler cancelled");
                    break;
                }
                Some(cmd) = commands_rx.recv() => {
                    if !handle_command(&ctx, cmd, &mut sessions).await {
                        break;
                    }
                }
                Some(msg) = worker_rx.recv() => {
                    if matches!(msg, WorkerMsg::ChunkFinished { .. }) {
                        in_flight -= 1;
                    }
                    handle_worker_msg(&ctx, msg, &sessions).await;
                }
            }
        }
    }
}

/// Shared loop state handed to the free handler functions.
struct LoopCtx {
    transport: Arc<dyn ChunkTransport>,
    config: UploaderConfig,
    events_tx: mpsc::Sender<UploadEvent>,
    worker_tx: mpsc::UnboundedSender<WorkerMsg>,
}

impl LoopCtx {
    async fn emit(&self, event: UploadEvent) {
        let _ = self.events_tx.send(event).await;
    }

    async fn emit_state(&self, file_id: &str, state: SessionState) {
        self.emit(UploadEvent::StateChanged {
            file_id: file_id.to_string(),
            state,
        })
        .await;
    }

    async fn emit_progress(&self, file_id: &str, session: &UploadSession) {
        self.emit(UploadEvent::Progress {
            file_id: file_id.to_string(),
            progress: session.progress(),
        })
        .await;
    }
}

/// Messages worker tasks send back into the loop.
enum WorkerMsg {
    StatusChecked {
        file_id: String,
        outcome: StatusOutcome,
    },
    ChunkFinished {
        file_id: String,
        index: u32,
        result: Result<ChunkAck, ChunkFailure>,
    },
    RetryReady {
        file_id: String,
        index: u32,
    },
}

/// Why a chunk attempt failed.
#[derive(Debug, thiserror::Error)]
enum ChunkFailure {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("local read failed: {0}")]
    LocalRead(String),
}

impl ChunkFailure {
    /// Local read errors are permanent: retrying a source file that
    /// cannot be read goes nowhere.
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_retryable())
    }
}

/// Fills free pool slots with pending chunks. Selection order:
/// earliest-added session first, lowest chunk index within it — one
/// file stays sequential while others interleave once it runs dry or
/// pauses. Returns the number of uploads spawned.
fn dispatch_ready(
    ctx: &LoopCtx,
    sessions: &mut Vec<Weak<UploadSession>>,
    in_flight: usize,
) -> usize {
    sessions.retain(|weak| weak.strong_count() > 0);

    let mut spawned = 0;
    while in_flight + spawned < ctx.config.max_concurrent_uploads {
        let Some((session, index)) = next_dispatch(sessions) else {
            break;
        };

        let (byte_offset, byte_length, attempt) = match session.begin_chunk(index) {
            Ok(values) => values,
            Err(e) => {
                // Transition bugs must not wedge the loop.
                error!(chunk = index, error = %e, "chunk dispatch failed");
                break;
            }
        };

        let file_id = session.file_id();
        let header = ChunkHeader {
            file_id: file_id.clone(),
            file_name: session.file_name(),
            chunk_index: index,
            total_chunks: session.total_chunks(),
            byte_offset,
            byte_length,
            checksum: String::new(),
        };
        debug!(
            file = %header.file_name,
            chunk = index,
            attempt,
            bytes = byte_length,
            "dispatching chunk"
        );

        let transport = Arc::clone(&ctx.transport);
        let path = session.path();
        let tx = ctx.worker_tx.clone();
        tokio::spawn(async move {
            let result = upload_chunk(transport, path, header).await;
            let _ = tx.send(WorkerMsg::ChunkFinished {
                file_id,
                index,
                result,
            });
        });
        spawned += 1;
    }
    spawned
}

/// Picks the next chunk to dispatch, or `None` if nothing is ready.
fn next_dispatch(sessions: &[Weak<UploadSession>]) -> Option<(Arc<UploadSession>, u32)> {
    for weak in sessions {
        let Some(session) = weak.upgrade() else {
            continue;
        };
        if session.state() != SessionState::Uploading {
            continue;
        }
        if let Some(index) = session.next_pending_chunk() {
            return Some((session, index));
        }
    }
    None
}

/// One chunk attempt: read the byte range, checksum it, send it.
async fn upload_chunk(
    transport: Arc<dyn ChunkTransport>,
    path: PathBuf,
    mut header: ChunkHeader,
) -> Result<ChunkAck, ChunkFailure> {
    let payload = read_chunk_bytes(&path, header.byte_offset, header.byte_length)
        .await
        .map_err(|e| ChunkFailure::LocalRead(e.to_string()))?;
    header.checksum = checksum_bytes(&payload);
    transport
        .send_chunk(header, payload)
        .await
        .map_err(ChunkFailure::Transport)
}

async fn read_chunk_bytes(path: &Path, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Handles one command. Returns false when the loop should stop.
async fn handle_command(
    ctx: &LoopCtx,
    cmd: Command,
    sessions: &mut Vec<Weak<UploadSession>>,
) -> bool {
    match cmd {
        Command::AddSession(session) => {
            let file_id = session.file_id();
            if session.state() != SessionState::Idle {
                warn!(file = %session.file_name(), state = ?session.state(), "session not idle, ignoring add");
                return true;
            }
            info!(
                file = %session.file_name(),
                chunks = session.total_chunks(),
                bytes = session.total_bytes(),
                "session added"
            );
            sessions.push(Arc::downgrade(&session));

            match session.apply(SessionEvent::StatusCheckStarted) {
                Ok(state) => ctx.emit_state(&file_id, state).await,
                Err(e) => {
                    error!(error = %e, "status check start failed");
                    return true;
                }
            }

            if ctx.config.status_check_enabled {
                let transport = Arc::clone(&ctx.transport);
                let tx = ctx.worker_tx.clone();
                tokio::spawn(async move {
                    let outcome = status::check_session(transport.as_ref(), &session).await;
                    let _ = tx.send(WorkerMsg::StatusChecked { file_id, outcome });
                });
            } else {
                // No query; walk the lifecycle straight to uploading.
                match session.apply(SessionEvent::StatusPartialOrNotFound) {
                    Ok(state) => ctx.emit_state(&file_id, state).await,
                    Err(e) => error!(error = %e, "session start failed"),
                }
            }
            true
        }
        Command::Pause(file_id) => {
            if let Some(session) = find_session(sessions, &file_id) {
                match session.apply(SessionEvent::PauseRequested) {
                    Ok(state) => {
                        info!(file = %session.file_name(), "paused");
                        ctx.emit_state(&file_id, state).await;
                    }
                    Err(e) => warn!(error = %e, "pause ignored"),
                }
            }
            true
        }
        Command::Resume(file_id) => {
            if let Some(session) = find_session(sessions, &file_id) {
                if !matches!(
                    session.state(),
                    SessionState::Paused | SessionState::Failed
                ) {
                    warn!(state = ?session.state(), "resume ignored");
                    return true;
                }
                let reset = session.reset_failed_chunks();
                match session.apply(SessionEvent::ResumeRequested) {
                    Ok(state) => {
                        info!(file = %session.file_name(), reset_chunks = reset, "resumed");
                        ctx.emit_state(&file_id, state).await;
                        // The last chunks may have drained while paused;
                        // completion was deferred until now.
                        maybe_complete(ctx, &file_id, &session).await;
                    }
                    Err(e) => warn!(error = %e, "resume ignored"),
                }
            }
            true
        }
        Command::Remove(file_id) => {
            sessions.retain(|weak| {
                weak.upgrade()
                    .is_some_and(|s| s.file_id() != file_id)
            });
            debug!(file_id, "session removed");
            true
        }
        Command::Shutdown => {
            info!("scheduler shutting down");
            false
        }
    }
}

/// Handles one worker outcome.
async fn handle_worker_msg(ctx: &LoopCtx, msg: WorkerMsg, sessions: &[Weak<UploadSession>]) {
    match msg {
        WorkerMsg::StatusChecked { file_id, outcome } => {
            let Some(session) = find_session(sessions, &file_id) else {
                return;
            };
            match status::apply_outcome(&session, outcome) {
                Ok(state) => {
                    ctx.emit_state(&file_id, state).await;
                    if state == SessionState::AlreadyComplete {
                        ctx.emit_progress(&file_id, &session).await;
                    }
                }
                Err(e) => error!(error = %e, "status outcome rejected"),
            }
        }

        WorkerMsg::ChunkFinished {
            file_id,
            index,
            result,
        } => {
            let Some(session) = find_session(sessions, &file_id) else {
                // Session removed while the chunk was in flight.
                return;
            };
            match result {
                Ok(_ack) => match session.mark_chunk_done(index) {
                    Ok(all_done) => {
                        ctx.emit_progress(&file_id, &session).await;
                        if all_done && session.state() == SessionState::Uploading {
                            maybe_complete(ctx, &file_id, &session).await;
                        }
                    }
                    Err(e) => error!(chunk = index, error = %e, "done transition rejected"),
                },
                Err(failure) => {
                    chunk_attempt_failed(ctx, &file_id, &session, index, failure).await;
                }
            }
        }

        WorkerMsg::RetryReady { file_id, index } => {
            let Some(session) = find_session(sessions, &file_id) else {
                return;
            };
            // The chunk may already be Pending again if the user
            // resumed in the meantime; that is fine.
            if let Err(e) = session.requeue_chunk(index) {
                debug!(chunk = index, error = %e, "retry requeue skipped");
            }
        }
    }
}

/// Records a failed attempt: requeues with backoff while budget
/// remains and the failure is transient; otherwise fails the chunk
/// (and the session) permanently.
async fn chunk_attempt_failed(
    ctx: &LoopCtx,
    file_id: &str,
    session: &Arc<UploadSession>,
    index: u32,
    failure: ChunkFailure,
) {
    let attempts = match session.mark_chunk_failed(index) {
        Ok(attempts) => attempts,
        Err(e) => {
            error!(chunk = index, error = %e, "fail transition rejected");
            return;
        }
    };
    ctx.emit_progress(file_id, session).await;

    if failure.is_retryable() && attempts < ctx.config.retry.max_attempts {
        let delay = ctx.config.retry.delay_for_attempt(attempts);
        debug!(
            file = %session.file_name(),
            chunk = index,
            attempts,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "chunk attempt failed, backing off"
        );
        let tx = ctx.worker_tx.clone();
        let file_id = file_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(WorkerMsg::RetryReady { file_id, index });
        });
        return;
    }

    warn!(
        file = %session.file_name(),
        chunk = index,
        attempts,
        error = %failure,
        "chunk failed permanently"
    );
    ctx.emit(UploadEvent::ChunkFailed {
        file_id: file_id.to_string(),
        chunk_index: index,
        error: failure.to_string(),
    })
    .await;
    if session.state() == SessionState::Uploading {
        match session.apply(SessionEvent::ChunkExhaustedRetries) {
            Ok(state) => ctx.emit_state(file_id, state).await,
            Err(e) => error!(error = %e, "failure transition rejected"),
        }
    }
}

/// Applies `AllChunksDone` if every chunk is done and the session is
/// uploading; emits the terminal events.
async fn maybe_complete(ctx: &LoopCtx, file_id: &str, session: &Arc<UploadSession>) {
    if !session.all_done() || session.state() != SessionState::Uploading {
        return;
    }
    match session.apply(SessionEvent::AllChunksDone) {
        Ok(state) => {
            info!(file = %session.file_name(), "upload completed");
            ctx.emit_state(file_id, state).await;
            ctx.emit(UploadEvent::Completed {
                file_id: file_id.to_string(),
            })
            .await;
        }
        Err(e) => error!(error = %e, "completion transition rejected"),
    }
}

fn find_session(sessions: &[Weak<UploadSession>], file_id: &str) -> Option<Arc<UploadSession>> {
    sessions
        .iter()
        .filter_map(Weak::upgrade)
        .find(|s| s.file_id() == file_id)
}
