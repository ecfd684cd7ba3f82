//! Wire protocol types shared by the chunkferry upload client and the
//! chunk server.
//!
//! The protocol has two exchanges:
//!
//! 1. **Status query** — sent once per file before any chunk is
//!    dispatched; classifies the upload as complete, partially stored
//!    (with the set of confirmed chunk indices), or unknown.
//! 2. **Chunk upload** — one JSON header plus a raw payload per chunk;
//!    acknowledged or rejected with a reason.
//!
//! All structs serialize as camelCase JSON. Chunk payloads are never
//! embedded in JSON — transports carry them as raw bytes after the
//! header.

pub mod messages;
pub mod types;

pub use messages::{ChunkAck, ChunkHeader, StatusRequest, StatusResponse};
pub use types::{RejectReason, StatusKind};

/// Current protocol version, bumped on incompatible wire changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Errors produced while validating protocol payloads.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid chunk header: {0}")]
    InvalidHeader(String),
}
