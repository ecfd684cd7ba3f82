use serde::{Deserialize, Serialize};

use crate::ProtocolError;
use crate::types::{RejectReason, StatusKind};

// ---------------------------------------------------------------------------
// Status query
// ---------------------------------------------------------------------------

/// Asks the server what it already holds for a file.
///
/// `file_name` is carried alongside the identifier for human
/// diagnostics and so the server can name the assembled file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    pub file_id: String,
    pub file_name: String,
}

/// Server answer to a [`StatusRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: StatusKind,
    /// Indices of chunks the server has already stored. Only populated
    /// for `in_progress`; lets the client resume exactly instead of
    /// re-probing chunk by chunk.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub confirmed_chunks: Vec<u32>,
    /// Size in bytes of the assembled file. Only populated for
    /// `complete`.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub size: u64,
}

impl StatusResponse {
    /// Response for a fully assembled file.
    pub fn complete(size: u64) -> Self {
        Self {
            status: StatusKind::Complete,
            confirmed_chunks: Vec::new(),
            size,
        }
    }

    /// Response for a partially stored file.
    pub fn in_progress(confirmed_chunks: Vec<u32>) -> Self {
        Self {
            status: StatusKind::InProgress,
            confirmed_chunks,
            size: 0,
        }
    }

    /// Response for an unknown file identifier.
    pub fn not_found() -> Self {
        Self {
            status: StatusKind::NotFound,
            confirmed_chunks: Vec::new(),
            size: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Chunk upload
// ---------------------------------------------------------------------------

/// Header preceding one chunk's raw payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    pub file_id: String,
    pub file_name: String,
    /// 0-based chunk ordinal.
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub byte_offset: u64,
    pub byte_length: u64,
    /// SHA-256 hex digest of the payload (empty means no verification).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}

impl ChunkHeader {
    /// Checks internal consistency before the payload is acted on.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.file_id.is_empty() {
            return Err(ProtocolError::InvalidHeader("empty file id".into()));
        }
        if self.file_name.is_empty() {
            return Err(ProtocolError::InvalidHeader("empty file name".into()));
        }
        if self.total_chunks == 0 {
            return Err(ProtocolError::InvalidHeader("zero total chunks".into()));
        }
        if self.chunk_index >= self.total_chunks {
            return Err(ProtocolError::InvalidHeader(format!(
                "chunk index {} out of range (total {})",
                self.chunk_index, self.total_chunks
            )));
        }
        if self.byte_length == 0 {
            return Err(ProtocolError::InvalidHeader("zero-length chunk".into()));
        }
        Ok(())
    }
}

/// Server acknowledgement of one chunk upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<RejectReason>,
    /// True when this chunk completed the file and the server
    /// assembled it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub assembled: bool,
}

impl ChunkAck {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reject_reason: None,
            assembled: false,
        }
    }

    pub fn assembled() -> Self {
        Self {
            accepted: true,
            reject_reason: None,
            assembled: true,
        }
    }

    pub fn rejected(reason: RejectReason) -> Self {
        Self {
            accepted: false,
            reject_reason: Some(reason),
            assembled: false,
        }
    }
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}
