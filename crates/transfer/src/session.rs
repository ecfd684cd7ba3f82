//! Upload session: all chunks of one file, the derived file
//! identifier, aggregate progress, and the session state machine.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use sha2::{Digest, Sha256};

use crate::TransferError;
use crate::chunk::{Chunk, ChunkStatus, chunk_layout};
use crate::state::{SessionEvent, SessionState, transition};

/// How much leading file content feeds the identifier hash.
const ID_SAMPLE_BYTES: usize = 64 * 1024;

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Derives the stable file identifier: SHA-256 over file name, size,
/// and the leading content sample.
///
/// Deterministic and independent of mutable state (no timestamps), so
/// the same file yields the same id across pause/resume and across
/// process restarts — which is what lets the server recognize a
/// resumed upload. A full-content hash would be stronger but costs a
/// complete read up front; the 64 KiB sample still separates files
/// that share name and size.
pub fn derive_file_id(file_name: &str, file_size: u64, content_sample: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_name.as_bytes());
    hasher.update(file_size.to_be_bytes());
    hasher.update(content_sample);
    hex::encode(hasher.finalize())
}

/// Tracks one file's full upload (thread-safe).
///
/// Owned as `Arc<UploadSession>` by the caller; the scheduler holds a
/// weak reference and never controls destruction.
pub struct UploadSession {
    inner: RwLock<SessionInner>,
}

struct SessionInner {
    file_id: String,
    file_name: String,
    path: PathBuf,
    total_bytes: u64,
    chunks: Vec<Chunk>,
    bytes_confirmed: u64,
    state: SessionState,
}

impl UploadSession {
    /// Builds a session by partitioning the file at `path` into
    /// `ceil(size / chunk_size)` chunks.
    ///
    /// Reads the file's metadata and its leading content sample for
    /// the identifier. Zero-byte files are rejected with
    /// [`TransferError::EmptyFile`].
    pub fn build(path: &Path, chunk_size: u64) -> Result<Self, TransferError> {
        use std::io::Read;

        let meta = std::fs::metadata(path)?;
        let total_bytes = meta.len();
        let display = path.display().to_string();
        if total_bytes == 0 {
            return Err(TransferError::EmptyFile(display));
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(display);

        let mut file = std::fs::File::open(path)?;
        let mut sample = vec![0u8; ID_SAMPLE_BYTES.min(total_bytes as usize)];
        file.read_exact(&mut sample)?;

        let file_id = derive_file_id(&file_name, total_bytes, &sample);
        let chunks = chunk_layout(total_bytes, chunk_size);

        Ok(Self {
            inner: RwLock::new(SessionInner {
                file_id,
                file_name,
                path: path.to_path_buf(),
                total_bytes,
                chunks,
                bytes_confirmed: 0,
                state: SessionState::Idle,
            }),
        })
    }

    pub fn file_id(&self) -> String {
        self.inner.read().unwrap().file_id.clone()
    }

    pub fn file_name(&self) -> String {
        self.inner.read().unwrap().file_name.clone()
    }

    pub fn path(&self) -> PathBuf {
        self.inner.read().unwrap().path.clone()
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.read().unwrap().total_bytes
    }

    pub fn total_chunks(&self) -> u32 {
        self.inner.read().unwrap().chunks.len() as u32
    }

    pub fn state(&self) -> SessionState {
        self.inner.read().unwrap().state
    }

    /// Bytes confirmed by the server so far (sum of Done chunk sizes).
    pub fn bytes_confirmed(&self) -> u64 {
        self.inner.read().unwrap().bytes_confirmed
    }

    /// Fraction of the file confirmed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        let s = self.inner.read().unwrap();
        s.bytes_confirmed as f64 / s.total_bytes as f64
    }

    /// Applies a lifecycle event, returning the new state.
    pub fn apply(&self, event: SessionEvent) -> Result<SessionState, TransferError> {
        let mut s = self.inner.write().unwrap();
        match transition(s.state, event) {
            Some(next) => {
                s.state = next;
                Ok(next)
            }
            None => Err(TransferError::IllegalTransition {
                state: s.state,
                event,
            }),
        }
    }

    /// Lowest-index Pending chunk, if any.
    pub fn next_pending_chunk(&self) -> Option<u32> {
        let s = self.inner.read().unwrap();
        s.chunks
            .iter()
            .find(|c| c.status == ChunkStatus::Pending)
            .map(|c| c.index)
    }

    /// Marks a chunk in flight and counts the attempt. Returns the
    /// chunk's `(byte_offset, byte_length, attempt_count)`.
    pub fn begin_chunk(&self, index: u32) -> Result<(u64, u64, u32), TransferError> {
        let mut s = self.inner.write().unwrap();
        let chunk = chunk_mut(&mut s.chunks, index)?;
        chunk.dispatch()?;
        Ok((chunk.byte_offset, chunk.byte_length, chunk.attempt_count))
    }

    /// Records a server acknowledgement. Returns true when every
    /// chunk is now Done.
    pub fn mark_chunk_done(&self, index: u32) -> Result<bool, TransferError> {
        let mut s = self.inner.write().unwrap();
        let chunk = chunk_mut(&mut s.chunks, index)?;
        chunk.complete()?;
        let len = chunk.byte_length;
        s.bytes_confirmed += len;
        Ok(s.chunks.iter().all(|c| c.status == ChunkStatus::Done))
    }

    /// Records a failed attempt. Returns the chunk's attempt count so
    /// the scheduler can decide between requeue and exhaustion.
    pub fn mark_chunk_failed(&self, index: u32) -> Result<u32, TransferError> {
        let mut s = self.inner.write().unwrap();
        let chunk = chunk_mut(&mut s.chunks, index)?;
        chunk.fail()?;
        Ok(chunk.attempt_count)
    }

    /// Returns a Failed chunk to Pending (retry timer fired).
    pub fn requeue_chunk(&self, index: u32) -> Result<(), TransferError> {
        let mut s = self.inner.write().unwrap();
        chunk_mut(&mut s.chunks, index)?.requeue()
    }

    /// Seeds chunks the server already holds as Done. Pre-flight only:
    /// runs before any dispatch, so it bypasses the runtime transition
    /// rules. Unknown indices are ignored.
    pub fn seed_confirmed(&self, indices: &[u32]) {
        let mut s = self.inner.write().unwrap();
        let mut confirmed = 0u64;
        for &index in indices {
            if let Some(chunk) = s.chunks.get_mut(index as usize)
                && chunk.status == ChunkStatus::Pending
            {
                chunk.status = ChunkStatus::Done;
                confirmed += chunk.byte_length;
            }
        }
        s.bytes_confirmed += confirmed;
    }

    /// Seeds every chunk as Done (status check said complete).
    pub fn seed_all_confirmed(&self) {
        let mut s = self.inner.write().unwrap();
        for chunk in &mut s.chunks {
            chunk.status = ChunkStatus::Done;
        }
        s.bytes_confirmed = s.total_bytes;
    }

    /// Resets every Failed chunk to Pending with a fresh attempt
    /// budget. Used by user-initiated resume.
    pub fn reset_failed_chunks(&self) -> usize {
        let mut s = self.inner.write().unwrap();
        let mut reset = 0;
        for chunk in &mut s.chunks {
            if chunk.status == ChunkStatus::Failed {
                chunk.status = ChunkStatus::Pending;
                chunk.attempt_count = 0;
                reset += 1;
            }
        }
        reset
    }

    pub fn all_done(&self) -> bool {
        let s = self.inner.read().unwrap();
        s.chunks.iter().all(|c| c.status == ChunkStatus::Done)
    }

    /// True while any chunk is InFlight.
    pub fn has_in_flight(&self) -> bool {
        let s = self.inner.read().unwrap();
        s.chunks.iter().any(|c| c.status == ChunkStatus::InFlight)
    }

    /// Snapshot of one chunk, for diagnostics and tests.
    pub fn chunk(&self, index: u32) -> Option<Chunk> {
        let s = self.inner.read().unwrap();
        s.chunks.get(index as usize).cloned()
    }
}

fn chunk_mut(chunks: &mut [Chunk], index: u32) -> Result<&mut Chunk, TransferError> {
    let total = chunks.len() as u32;
    chunks
        .get_mut(index as usize)
        .ok_or(TransferError::ChunkOutOfRange { index, total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(data: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        (dir, path)
    }

    #[test]
    fn build_partitions_file() {
        let (_dir, path) = temp_file(&[0xAB; 20]);
        let session = UploadSession::build(&path, 8).unwrap();
        assert_eq!(session.total_chunks(), 3);
        assert_eq!(session.total_bytes(), 20);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.progress(), 0.0);
        assert_eq!(session.chunk(2).unwrap().byte_length, 4);
    }

    #[test]
    fn build_rejects_empty_file() {
        let (_dir, path) = temp_file(b"");
        let result = UploadSession::build(&path, 8);
        assert!(matches!(result, Err(TransferError::EmptyFile(_))));
    }

    #[test]
    fn file_id_deterministic_and_distinct() {
        let id1 = derive_file_id("a.bin", 100, b"hello");
        let id2 = derive_file_id("a.bin", 100, b"hello");
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 64);

        // Different name, size, or content all change the id.
        assert_ne!(id1, derive_file_id("b.bin", 100, b"hello"));
        assert_ne!(id1, derive_file_id("a.bin", 101, b"hello"));
        assert_ne!(id1, derive_file_id("a.bin", 100, b"jello"));
    }

    #[test]
    fn rebuilding_session_yields_same_id() {
        let (_dir, path) = temp_file(&[0x42; 100]);
        let first = UploadSession::build(&path, 8).unwrap();
        let second = UploadSession::build(&path, 8).unwrap();
        assert_eq!(first.file_id(), second.file_id());
    }

    #[test]
    fn progress_tracks_done_chunks() {
        let (_dir, path) = temp_file(&[1u8; 20]);
        let session = UploadSession::build(&path, 8).unwrap();

        session.begin_chunk(0).unwrap();
        assert!(!session.mark_chunk_done(0).unwrap());
        assert_eq!(session.bytes_confirmed(), 8);
        assert!((session.progress() - 0.4).abs() < 1e-9);

        session.begin_chunk(1).unwrap();
        session.begin_chunk(2).unwrap();
        assert!(!session.mark_chunk_done(1).unwrap());
        // Out-of-order completion is fine.
        assert!(session.mark_chunk_done(2).unwrap());
        assert_eq!(session.progress(), 1.0);
        assert!(session.all_done());
    }

    #[test]
    fn seed_confirmed_skips_dispatch() {
        let (_dir, path) = temp_file(&[1u8; 20]);
        let session = UploadSession::build(&path, 8).unwrap();
        session.seed_confirmed(&[0, 1]);
        assert_eq!(session.bytes_confirmed(), 16);
        assert_eq!(session.next_pending_chunk(), Some(2));

        // Seeding twice (or with unknown indices) changes nothing.
        session.seed_confirmed(&[0, 1, 99]);
        assert_eq!(session.bytes_confirmed(), 16);
    }

    #[test]
    fn seed_all_reaches_full_progress() {
        let (_dir, path) = temp_file(&[1u8; 20]);
        let session = UploadSession::build(&path, 8).unwrap();
        session.seed_all_confirmed();
        assert_eq!(session.progress(), 1.0);
        assert!(session.all_done());
        assert_eq!(session.next_pending_chunk(), None);
    }

    #[test]
    fn lifecycle_events() {
        let (_dir, path) = temp_file(&[1u8; 8]);
        let session = UploadSession::build(&path, 8).unwrap();

        assert_eq!(
            session.apply(SessionEvent::StatusCheckStarted).unwrap(),
            SessionState::Checking
        );
        assert_eq!(
            session.apply(SessionEvent::StatusPartialOrNotFound).unwrap(),
            SessionState::Uploading
        );
        // Pausing twice is illegal.
        session.apply(SessionEvent::PauseRequested).unwrap();
        assert!(matches!(
            session.apply(SessionEvent::PauseRequested),
            Err(TransferError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn reset_failed_restores_budget() {
        let (_dir, path) = temp_file(&[1u8; 20]);
        let session = UploadSession::build(&path, 8).unwrap();

        session.begin_chunk(0).unwrap();
        assert_eq!(session.mark_chunk_failed(0).unwrap(), 1);
        session.begin_chunk(0).unwrap();
        assert_eq!(session.mark_chunk_failed(0).unwrap(), 2);

        assert_eq!(session.reset_failed_chunks(), 1);
        let chunk = session.chunk(0).unwrap();
        assert_eq!(chunk.status, ChunkStatus::Pending);
        assert_eq!(chunk.attempt_count, 0);
    }

    #[test]
    fn out_of_range_chunk_rejected() {
        let (_dir, path) = temp_file(&[1u8; 8]);
        let session = UploadSession::build(&path, 8).unwrap();
        assert!(matches!(
            session.begin_chunk(5),
            Err(TransferError::ChunkOutOfRange { index: 5, total: 1 })
        ));
    }

    #[test]
    fn checksum_helper_matches_known_shape() {
        let c1 = checksum_bytes(b"hello world");
        assert_eq!(c1.len(), 64);
        assert_eq!(c1, checksum_bytes(b"hello world"));
        assert_ne!(c1, checksum_bytes(b"hello worle"));
    }
}
