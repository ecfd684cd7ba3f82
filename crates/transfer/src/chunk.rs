//! Chunk model: a fixed-size byte range of a file and its upload
//! status, with precondition-checked status transitions.

use serde::Serialize;

use crate::TransferError;

/// Upload status of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Waiting for a pool slot.
    Pending,
    /// A transport attempt is outstanding.
    InFlight,
    /// The server acknowledged this chunk.
    Done,
    /// The last attempt failed; may be requeued or left for resume.
    Failed,
}

/// One contiguous byte range of a file — the unit of upload and retry.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// 0-based ordinal within the file.
    pub index: u32,
    pub byte_offset: u64,
    pub byte_length: u64,
    pub status: ChunkStatus,
    /// Transport attempts made so far (incremented on dispatch).
    pub attempt_count: u32,
}

impl Chunk {
    fn new(index: u32, byte_offset: u64, byte_length: u64) -> Self {
        Self {
            index,
            byte_offset,
            byte_length,
            status: ChunkStatus::Pending,
            attempt_count: 0,
        }
    }

    /// `Pending | Failed -> InFlight`; counts the attempt.
    pub(crate) fn dispatch(&mut self) -> Result<(), TransferError> {
        match self.status {
            ChunkStatus::Pending | ChunkStatus::Failed => {
                self.status = ChunkStatus::InFlight;
                self.attempt_count += 1;
                Ok(())
            }
            from => Err(self.invalid(from, ChunkStatus::InFlight)),
        }
    }

    /// `InFlight -> Done`.
    pub(crate) fn complete(&mut self) -> Result<(), TransferError> {
        match self.status {
            ChunkStatus::InFlight => {
                self.status = ChunkStatus::Done;
                Ok(())
            }
            from => Err(self.invalid(from, ChunkStatus::Done)),
        }
    }

    /// `InFlight -> Failed`.
    pub(crate) fn fail(&mut self) -> Result<(), TransferError> {
        match self.status {
            ChunkStatus::InFlight => {
                self.status = ChunkStatus::Failed;
                Ok(())
            }
            from => Err(self.invalid(from, ChunkStatus::Failed)),
        }
    }

    /// `Failed -> Pending` (retry timer fired or user resumed).
    pub(crate) fn requeue(&mut self) -> Result<(), TransferError> {
        match self.status {
            ChunkStatus::Failed => {
                self.status = ChunkStatus::Pending;
                Ok(())
            }
            from => Err(self.invalid(from, ChunkStatus::Pending)),
        }
    }

    fn invalid(&self, from: ChunkStatus, to: ChunkStatus) -> TransferError {
        TransferError::InvalidTransition {
            index: self.index,
            from,
            to,
        }
    }
}

/// Partitions `[0, file_size)` into `ceil(file_size / chunk_size)`
/// chunks. Every chunk except possibly the last has `chunk_size`
/// bytes; there are no gaps and no overlaps.
///
/// `file_size` of 0 yields an empty layout — callers reject that
/// earlier (see [`UploadSession::build`](crate::UploadSession::build)).
pub fn chunk_layout(file_size: u64, chunk_size: u64) -> Vec<Chunk> {
    assert!(chunk_size > 0, "chunk_size must be positive");
    let mut chunks = Vec::new();
    let mut offset = 0u64;
    let mut index = 0u32;
    while offset < file_size {
        let len = chunk_size.min(file_size - offset);
        chunks.push(Chunk::new(index, offset, len));
        offset += len;
        index += 1;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_exact_multiple() {
        let chunks = chunk_layout(16, 4);
        assert_eq!(chunks.len(), 4);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i as u32);
            assert_eq!(c.byte_offset, i as u64 * 4);
            assert_eq!(c.byte_length, 4);
            assert_eq!(c.status, ChunkStatus::Pending);
        }
    }

    #[test]
    fn layout_short_last_chunk() {
        // 20 units with chunk size 8 -> 8, 8, 4.
        let chunks = chunk_layout(20, 8);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].byte_length, 8);
        assert_eq!(chunks[1].byte_length, 8);
        assert_eq!(chunks[2].byte_length, 4);
        assert_eq!(chunks[2].byte_offset, 16);
    }

    #[test]
    fn layout_single_undersized_chunk() {
        let chunks = chunk_layout(3, 8);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].byte_length, 3);
    }

    #[test]
    fn layout_partitions_without_gaps() {
        for (size, chunk) in [(1u64, 1u64), (7, 3), (100, 9), (4096, 512), (4097, 512)] {
            let chunks = chunk_layout(size, chunk);
            assert_eq!(chunks.len() as u64, size.div_ceil(chunk));
            let mut expected_offset = 0;
            for c in &chunks {
                assert_eq!(c.byte_offset, expected_offset, "gap or overlap at {c:?}");
                expected_offset += c.byte_length;
            }
            assert_eq!(expected_offset, size);
        }
    }

    #[test]
    fn layout_empty_file() {
        assert!(chunk_layout(0, 8).is_empty());
    }

    #[test]
    fn dispatch_counts_attempts() {
        let mut c = Chunk::new(0, 0, 4);
        c.dispatch().unwrap();
        assert_eq!(c.status, ChunkStatus::InFlight);
        assert_eq!(c.attempt_count, 1);

        c.fail().unwrap();
        c.dispatch().unwrap();
        assert_eq!(c.attempt_count, 2);
    }

    #[test]
    fn full_lifecycle() {
        let mut c = Chunk::new(0, 0, 4);
        c.dispatch().unwrap();
        c.fail().unwrap();
        c.requeue().unwrap();
        assert_eq!(c.status, ChunkStatus::Pending);
        c.dispatch().unwrap();
        c.complete().unwrap();
        assert_eq!(c.status, ChunkStatus::Done);
    }

    #[test]
    fn illegal_transitions_rejected() {
        let mut c = Chunk::new(2, 0, 4);

        // Pending -> Done is not a thing.
        assert!(matches!(
            c.complete(),
            Err(TransferError::InvalidTransition { index: 2, .. })
        ));
        // Pending -> Failed is not a thing.
        assert!(c.fail().is_err());
        // Pending -> Pending requeue is not a thing.
        assert!(c.requeue().is_err());

        c.dispatch().unwrap();
        // InFlight -> InFlight double dispatch.
        assert!(c.dispatch().is_err());

        c.complete().unwrap();
        // Done is terminal.
        assert!(c.dispatch().is_err());
        assert!(c.fail().is_err());
        assert!(c.requeue().is_err());
    }
}
