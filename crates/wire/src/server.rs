//! Reference chunk server.
//!
//! Stores incoming chunks as part files under
//! `<root>/partial/<file_id>/<index>.part` and assembles the final
//! file at `<root>/<file_name>` once every part is present. The
//! pre-flight status query is answered from the same layout: an
//! assembled file means complete, a partial directory means in
//! progress with the part indices it holds, anything else is unknown.
//!
//! Every connection carries exactly one request; chunk ordering and
//! retries are entirely the client's concern.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chunkferry_protocol::{ChunkAck, ChunkHeader, RejectReason, StatusRequest, StatusResponse};
use chunkferry_transfer::checksum_bytes;

use crate::error::WireError;
use crate::wire::{
    OP_CHUNK, OP_STATUS, read_json_frame, read_token, write_auth_response, write_error_response,
    write_ok_response,
};
use crate::{AUTH_TIMEOUT, BUFFER_SIZE, PART_TTL, SWEEP_INTERVAL};

/// Subdirectory of the storage root holding in-progress uploads.
const PARTIAL_DIR: &str = "partial";

/// Upper bound on a single chunk payload (64 MiB).
const MAX_CHUNK_LEN: u64 = 64 * 1024 * 1024;

/// TCP chunk server over a storage root directory.
pub struct ChunkServer {
    root: PathBuf,
    token: String,
    cancel: CancellationToken,
}

impl ChunkServer {
    pub fn new(root: PathBuf, token: String, cancel: CancellationToken) -> Self {
        Self {
            root,
            token,
            cancel,
        }
    }

    /// Binds the listener. `addr` may use port 0 for an ephemeral port;
    /// the bound address is returned. Reuse-addr is set so a restarted
    /// server can rebind its previous port immediately.
    pub async fn listen(&self, addr: &str) -> Result<(SocketAddr, TcpListener), WireError> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| WireError::Protocol(format!("invalid listen address: {e}")))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(128)?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, root = %self.root.display(), "chunk server listening");
        Ok((local_addr, listener))
    }

    /// Accepts connections until cancelled. Stale partial uploads are
    /// swept periodically.
    pub async fn run(self, listener: TcpListener) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("chunk server stopping");
                    break;
                }
                _ = sweep.tick() => {
                    match Self::sweep_stale(&self.root, PART_TTL).await {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, "swept stale partial uploads"),
                        Err(e) => warn!(error = %e, "sweep failed"),
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    debug!(%peer, "connection accepted");
                    let root = self.root.clone();
                    let token = self.token.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &root, &token).await {
                            warn!(%peer, error = %e, "connection failed");
                        }
                    });
                }
            }
        }
    }

    /// Removes partial upload directories that have not been touched
    /// for `ttl`. Returns the number of directories removed.
    pub async fn sweep_stale(root: &Path, ttl: Duration) -> Result<usize, WireError> {
        let partial_root = root.join(PARTIAL_DIR);
        let mut entries = match tokio::fs::read_dir(&partial_root).await {
            Ok(entries) => entries,
            // Nothing uploaded yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = std::time::SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if age.is_some_and(|age| age >= ttl) {
                debug!(dir = %entry.path().display(), "removing stale partial upload");
                tokio::fs::remove_dir_all(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

async fn handle_connection(
    stream: TcpStream,
    root: &Path,
    expected_token: &str,
) -> Result<(), WireError> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, reader);
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, writer);

    let received = match tokio::time::timeout(AUTH_TIMEOUT, read_token(&mut reader)).await {
        Ok(Ok(token)) => token,
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(WireError::Timeout),
    };
    if !crate::wire::validate_token(&received, expected_token) {
        write_auth_response(&mut writer, false).await?;
        return Err(WireError::AuthFailed("invalid token".into()));
    }
    write_auth_response(&mut writer, true).await?;

    let opcode = reader.read_u8().await?;
    match opcode {
        OP_STATUS => {
            let request: StatusRequest = read_json_frame(&mut reader).await?;
            match handle_status(root, &request).await {
                Ok(response) => write_ok_response(&mut writer, &response).await?,
                Err(e) => {
                    warn!(file = %request.file_name, error = %e, "status failed");
                    write_error_response(&mut writer, &e.to_string()).await?;
                }
            }
        }
        OP_CHUNK => {
            let header: ChunkHeader = read_json_frame(&mut reader).await?;
            if let Err(e) = header.validate() {
                write_error_response(&mut writer, &e.to_string()).await?;
                return Err(WireError::Protocol(e.to_string()));
            }
            if header.byte_length > MAX_CHUNK_LEN {
                let message = format!(
                    "chunk too large: {} bytes (max {MAX_CHUNK_LEN})",
                    header.byte_length
                );
                write_error_response(&mut writer, &message).await?;
                return Err(WireError::Protocol(message));
            }

            let mut payload = vec![0u8; header.byte_length as usize];
            reader.read_exact(&mut payload).await?;

            match handle_chunk(root, &header, &payload).await {
                Ok(ack) => write_ok_response(&mut writer, &ack).await?,
                Err(e) => {
                    warn!(file = %header.file_name, chunk = header.chunk_index, error = %e, "chunk failed");
                    write_error_response(&mut writer, &e.to_string()).await?;
                }
            }
        }
        other => {
            let message = format!("unknown opcode: {other:#04x}");
            write_error_response(&mut writer, &message).await?;
            return Err(WireError::Protocol(message));
        }
    }
    Ok(())
}

/// Answers a pre-flight status query from the storage layout.
async fn handle_status(root: &Path, request: &StatusRequest) -> Result<StatusResponse, WireError> {
    let file_name = sanitize_name(&request.file_name)?;
    let file_id = sanitize_name(&request.file_id)?;

    if let Ok(metadata) = tokio::fs::metadata(root.join(file_name)).await
        && metadata.is_file()
    {
        return Ok(StatusResponse::complete(metadata.len()));
    }

    let partial_dir = root.join(PARTIAL_DIR).join(file_id);
    match confirmed_parts(&partial_dir).await? {
        Some(indices) => Ok(StatusResponse::in_progress(indices)),
        None => Ok(StatusResponse::not_found()),
    }
}

/// Stores one chunk and assembles the file when it was the last one.
async fn handle_chunk(
    root: &Path,
    header: &ChunkHeader,
    payload: &[u8],
) -> Result<ChunkAck, WireError> {
    let file_name = match sanitize_name(&header.file_name) {
        Ok(name) => name,
        Err(_) => return Ok(ChunkAck::rejected(RejectReason::IdentifierConflict)),
    };
    let file_id = match sanitize_name(&header.file_id) {
        Ok(id) => id,
        Err(_) => return Ok(ChunkAck::rejected(RejectReason::IdentifierConflict)),
    };

    if checksum_bytes(payload) != header.checksum {
        return Ok(ChunkAck::rejected(RejectReason::ChecksumMismatch));
    }

    let final_path = root.join(file_name);
    if tokio::fs::try_exists(&final_path).await? {
        // Duplicate of an already-assembled file; nothing to store.
        return Ok(ChunkAck::assembled());
    }

    let partial_dir = root.join(PARTIAL_DIR).join(file_id);
    tokio::fs::create_dir_all(&partial_dir).await?;
    let part_path = partial_dir.join(format!("{}.part", header.chunk_index));
    tokio::fs::write(&part_path, payload).await?;
    debug!(
        file = %header.file_name,
        chunk = header.chunk_index,
        bytes = payload.len(),
        "part stored"
    );

    if has_all_parts(&partial_dir, header.total_chunks).await? {
        assemble(&partial_dir, &final_path, header.total_chunks).await?;
        tokio::fs::remove_dir_all(&partial_dir).await?;
        info!(file = %header.file_name, chunks = header.total_chunks, "file assembled");
        return Ok(ChunkAck::assembled());
    }

    Ok(ChunkAck::accepted())
}

/// Lists the part indices stored in a partial directory, sorted.
/// `None` when the directory does not exist.
async fn confirmed_parts(partial_dir: &Path) -> Result<Option<Vec<u32>>, WireError> {
    let mut entries = match tokio::fs::read_dir(partial_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut indices = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".part")) else {
            continue;
        };
        if let Ok(index) = stem.parse::<u32>() {
            indices.push(index);
        }
    }
    indices.sort_unstable();
    Ok(Some(indices))
}

async fn has_all_parts(partial_dir: &Path, total_chunks: u32) -> Result<bool, WireError> {
    match confirmed_parts(partial_dir).await? {
        Some(indices) => {
            Ok(indices.len() == total_chunks as usize
                && indices.iter().enumerate().all(|(i, &idx)| idx == i as u32))
        }
        None => Ok(false),
    }
}

/// Concatenates parts in index order into the final file. Writes to a
/// sibling temp name first so a crash never leaves a half-assembled
/// file at the final path.
async fn assemble(
    partial_dir: &Path,
    final_path: &Path,
    total_chunks: u32,
) -> Result<(), WireError> {
    let tmp_path = final_path.with_extension("assembling");
    let mut out = tokio::fs::File::create(&tmp_path).await?;
    for index in 0..total_chunks {
        let part = tokio::fs::read(partial_dir.join(format!("{index}.part"))).await?;
        out.write_all(&part).await?;
    }
    out.flush().await?;
    drop(out);
    tokio::fs::rename(&tmp_path, final_path).await?;
    Ok(())
}

/// Accepts plain file names only: no path separators, no traversal,
/// nothing hidden.
fn sanitize_name(name: &str) -> Result<&str, WireError> {
    if name.is_empty() {
        return Err(WireError::InvalidName("empty name".into()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(WireError::InvalidName(format!(
            "path separators not allowed: {name}"
        )));
    }
    if name == "." || name == ".." || name.starts_with('.') {
        return Err(WireError::InvalidName(format!(
            "hidden or relative name not allowed: {name}"
        )));
    }
    if name.len() >= 2 && name.as_bytes()[1] == b':' {
        return Err(WireError::InvalidName(format!(
            "Windows drive prefix not allowed: {name}"
        )));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_rejects_traversal() {
        assert!(sanitize_name("").is_err());
        assert!(sanitize_name("..").is_err());
        assert!(sanitize_name("../secret").is_err());
        assert!(sanitize_name("a/b").is_err());
        assert!(sanitize_name("a\\b").is_err());
        assert!(sanitize_name(".hidden").is_err());
        assert!(sanitize_name("C:\\Windows").is_err());
    }

    #[test]
    fn sanitize_allows_plain_names() {
        assert!(sanitize_name("video.mkv").is_ok());
        assert!(sanitize_name("archive.tar.gz").is_ok());
        assert!(sanitize_name("a1b2c3").is_ok());
    }

    #[tokio::test]
    async fn status_reflects_storage_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        // Unknown file.
        let request = StatusRequest {
            file_id: "id1".into(),
            file_name: "report.pdf".into(),
        };
        let response = handle_status(root, &request).await.unwrap();
        assert_eq!(response.status, chunkferry_protocol::StatusKind::NotFound);

        // Partial upload with parts 0 and 2.
        let partial = root.join(PARTIAL_DIR).join("id1");
        std::fs::create_dir_all(&partial).unwrap();
        std::fs::write(partial.join("0.part"), b"aaaa").unwrap();
        std::fs::write(partial.join("2.part"), b"cccc").unwrap();
        let response = handle_status(root, &request).await.unwrap();
        assert_eq!(response.status, chunkferry_protocol::StatusKind::InProgress);
        assert_eq!(response.confirmed_chunks, vec![0, 2]);

        // Assembled file wins over leftovers.
        std::fs::write(root.join("report.pdf"), b"full contents").unwrap();
        let response = handle_status(root, &request).await.unwrap();
        assert_eq!(response.status, chunkferry_protocol::StatusKind::Complete);
        assert_eq!(response.size, 13);
    }

    #[tokio::test]
    async fn chunks_assemble_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let parts: [&[u8]; 3] = [b"first-", b"second-", b"third"];
        // Deliver out of order.
        for index in [2u32, 0, 1] {
            let payload = parts[index as usize];
            let header = ChunkHeader {
                file_id: "id2".into(),
                file_name: "joined.txt".into(),
                chunk_index: index,
                total_chunks: 3,
                byte_offset: 0,
                byte_length: payload.len() as u64,
                checksum: checksum_bytes(payload),
            };
            let ack = handle_chunk(root, &header, payload).await.unwrap();
            assert!(ack.accepted);
            assert_eq!(ack.assembled, index == 1, "assembled only on last part");
        }

        let assembled = std::fs::read(root.join("joined.txt")).unwrap();
        assert_eq!(assembled, b"first-second-third");
        assert!(!root.join(PARTIAL_DIR).join("id2").exists());
    }

    #[tokio::test]
    async fn duplicate_chunk_overwrites_part() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let payload: &[u8] = b"same bytes";
        let header = ChunkHeader {
            file_id: "id3".into(),
            file_name: "dup.bin".into(),
            chunk_index: 0,
            total_chunks: 2,
            byte_offset: 0,
            byte_length: payload.len() as u64,
            checksum: checksum_bytes(payload),
        };

        let first = handle_chunk(root, &header, payload).await.unwrap();
        let second = handle_chunk(root, &header, payload).await.unwrap();
        assert!(first.accepted && second.accepted);
        assert!(!second.assembled);

        let parts = confirmed_parts(&root.join(PARTIAL_DIR).join("id3"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parts, vec![0]);
    }

    #[tokio::test]
    async fn checksum_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let header = ChunkHeader {
            file_id: "id4".into(),
            file_name: "x.bin".into(),
            chunk_index: 0,
            total_chunks: 1,
            byte_offset: 0,
            byte_length: 4,
            checksum: checksum_bytes(b"good"),
        };

        let ack = handle_chunk(dir.path(), &header, b"evil").await.unwrap();
        assert!(!ack.accepted);
        assert_eq!(ack.reject_reason, Some(RejectReason::ChecksumMismatch));
        assert!(!dir.path().join(PARTIAL_DIR).join("id4").exists());
    }

    #[tokio::test]
    async fn traversal_name_rejected_as_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let payload: &[u8] = b"zzzz";
        let header = ChunkHeader {
            file_id: "id5".into(),
            file_name: "../escape.bin".into(),
            chunk_index: 0,
            total_chunks: 1,
            byte_offset: 0,
            byte_length: payload.len() as u64,
            checksum: checksum_bytes(payload),
        };

        let ack = handle_chunk(dir.path(), &header, payload).await.unwrap();
        assert!(!ack.accepted);
        assert_eq!(ack.reject_reason, Some(RejectReason::IdentifierConflict));
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let stale = root.join(PARTIAL_DIR).join("old");
        let fresh = root.join(PARTIAL_DIR).join("new");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::create_dir_all(&fresh).unwrap();

        // ttl zero: everything qualifies.
        let removed = ChunkServer::sweep_stale(root, Duration::ZERO).await.unwrap();
        assert_eq!(removed, 2);

        // ttl large: nothing qualifies.
        std::fs::create_dir_all(root.join(PARTIAL_DIR).join("again")).unwrap();
        let removed = ChunkServer::sweep_stale(root, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn sweep_on_empty_root_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let removed = ChunkServer::sweep_stale(dir.path(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }
}
