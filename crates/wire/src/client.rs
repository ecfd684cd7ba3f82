//! TCP wire client: the transport the upload scheduler plugs into.
//!
//! Opens one short-lived connection per request, authenticates with
//! the shared token, sends exactly one request, and reads exactly one
//! response. Retrying is the scheduler's job, not the transport's.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use tokio::io::{BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::debug;

use chunkferry_protocol::{ChunkAck, ChunkHeader, RejectReason, StatusRequest, StatusResponse};
use chunkferry_transfer::{ChunkTransport, TransportError};

use crate::error::WireError;
use crate::wire::{
    OP_CHUNK, OP_STATUS, read_auth_response, read_response, write_json_frame, write_token,
};
use crate::{AUTH_TIMEOUT, BUFFER_SIZE, CONNECT_TIMEOUT};

/// TCP implementation of [`ChunkTransport`].
#[derive(Debug, Clone)]
pub struct WireTransport {
    addr: SocketAddr,
    token: String,
}

impl WireTransport {
    pub fn new(addr: SocketAddr, token: String) -> Self {
        Self { addr, token }
    }

    /// Connects and authenticates; returns the framed stream halves.
    async fn connect(
        &self,
    ) -> Result<
        (
            BufReader<tokio::net::tcp::OwnedReadHalf>,
            BufWriter<tokio::net::tcp::OwnedWriteHalf>,
        ),
        WireError,
    > {
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(WireError::Timeout),
        };
        debug!(addr = %self.addr, "wire connection established");

        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::with_capacity(BUFFER_SIZE, reader);
        let mut writer = BufWriter::with_capacity(BUFFER_SIZE, writer);

        write_token(&mut writer, &self.token).await?;
        tokio::io::AsyncWriteExt::flush(&mut writer).await?;

        let accepted =
            match tokio::time::timeout(AUTH_TIMEOUT, read_auth_response(&mut reader)).await {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(WireError::Timeout),
            };
        if !accepted {
            return Err(WireError::AuthFailed("server rejected token".into()));
        }

        Ok((reader, writer))
    }

    async fn send_chunk_inner(
        &self,
        header: ChunkHeader,
        payload: Vec<u8>,
    ) -> Result<ChunkAck, WireError> {
        use tokio::io::AsyncWriteExt;

        let (mut reader, mut writer) = self.connect().await?;

        writer.write_u8(OP_CHUNK).await?;
        write_json_frame(&mut writer, &header).await?;
        writer.write_all(&payload).await?;
        writer.flush().await?;

        let ack: ChunkAck = read_response(&mut reader).await?;
        debug!(
            file = %header.file_name,
            chunk = header.chunk_index,
            accepted = ack.accepted,
            assembled = ack.assembled,
            "chunk response"
        );
        Ok(ack)
    }

    async fn check_status_inner(
        &self,
        request: StatusRequest,
    ) -> Result<StatusResponse, WireError> {
        use tokio::io::AsyncWriteExt;

        let (mut reader, mut writer) = self.connect().await?;

        writer.write_u8(OP_STATUS).await?;
        write_json_frame(&mut writer, &request).await?;
        writer.flush().await?;

        read_response(&mut reader).await
    }
}

/// Maps a wire failure to the scheduler's retryability split: a
/// server-reported failure is the server's problem (retryable as
/// unavailable), everything else is a network-level failure.
fn map_wire_error(error: WireError) -> TransportError {
    match error {
        WireError::Remote(message) => TransportError::ServerUnavailable(message),
        other => TransportError::Network(other.to_string()),
    }
}

impl ChunkTransport for WireTransport {
    fn send_chunk(
        &self,
        header: ChunkHeader,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<ChunkAck, TransportError>> + Send + '_>> {
        Box::pin(async move {
            let ack = self
                .send_chunk_inner(header, payload)
                .await
                .map_err(map_wire_error)?;
            if !ack.accepted {
                let reason = ack.reject_reason.unwrap_or(RejectReason::StorageError);
                return Err(TransportError::Rejected(reason));
            }
            Ok(ack)
        })
    }

    fn check_status(
        &self,
        request: StatusRequest,
    ) -> Pin<Box<dyn Future<Output = Result<StatusResponse, TransportError>> + Send + '_>> {
        Box::pin(async move { self.check_status_inner(request).await.map_err(map_wire_error) })
    }
}
