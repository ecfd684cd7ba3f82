//! TCP wire format for chunk exchanges.
//!
//! Each request runs on its own short-lived connection — one attempt,
//! no connection state to resynchronize after a failure.
//!
//! # Wire format
//!
//! ```text
//! HANDSHAKE (client -> server): [32 bytes: hex token ASCII]
//! AUTH RESPONSE (server -> client): [1 byte: 0x01=OK, 0x00=rejected]
//!
//! REQUEST: [1 byte: opcode]
//!   STATUS (0x01): [4 bytes BE: json_len][json: status request]
//!   CHUNK  (0x02): [4 bytes BE: json_len][json: chunk header]
//!                  [byte_length bytes: raw chunk data]
//!
//! RESPONSE: [1 byte: 0x01=OK, 0x00=server error]
//!   OK:    [4 bytes BE: json_len][json: status response or chunk ack]
//!   ERROR: [4 bytes BE: msg_len][msg_len bytes: UTF-8 message]
//! ```

use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::WireError;

/// Request opcode: file status query.
pub const OP_STATUS: u8 = 0x01;

/// Request opcode: chunk upload.
pub const OP_CHUNK: u8 = 0x02;

/// Response status: request handled, JSON body follows.
pub const RESP_OK: u8 = 0x01;

/// Response status: server-side failure, error message follows.
pub const RESP_ERROR: u8 = 0x00;

/// Authentication response: accepted.
pub const AUTH_OK: u8 = 0x01;

/// Authentication response: rejected.
pub const AUTH_REJECTED: u8 = 0x00;

/// Token length in bytes (32 hex characters).
pub const TOKEN_LEN: usize = 32;

/// Upper bound on a JSON frame. Headers and status responses are
/// small; anything bigger is a corrupt stream.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Writes a length-prefixed JSON frame.
pub async fn write_json_frame<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    value: &T,
) -> Result<(), WireError> {
    let bytes =
        serde_json::to_vec(value).map_err(|e| WireError::Protocol(format!("encode: {e}")))?;
    if bytes.len() > MAX_FRAME_LEN as usize {
        return Err(WireError::Protocol(format!(
            "frame too large: {} bytes (max {MAX_FRAME_LEN})",
            bytes.len()
        )));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Reads a length-prefixed JSON frame.
pub async fn read_json_frame<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<T, WireError> {
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(WireError::Protocol(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_LEN})"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(|e| WireError::Protocol(format!("decode: {e}")))
}

/// Writes an error response: status byte plus UTF-8 message.
pub async fn write_error_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &str,
) -> Result<(), WireError> {
    let bytes = message.as_bytes();
    let len = bytes.len().min(MAX_FRAME_LEN as usize);
    writer.write_u8(RESP_ERROR).await?;
    writer.write_u32(len as u32).await?;
    writer.write_all(&bytes[..len]).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes a success response: status byte plus JSON body.
pub async fn write_ok_response<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    body: &T,
) -> Result<(), WireError> {
    writer.write_u8(RESP_OK).await?;
    write_json_frame(writer, body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a response: `Ok(body)` on success, [`WireError::Remote`] when
/// the server reported a failure.
pub async fn read_response<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<T, WireError> {
    let status = reader.read_u8().await?;
    match status {
        RESP_OK => read_json_frame(reader).await,
        RESP_ERROR => {
            let len = reader.read_u32().await?;
            if len > MAX_FRAME_LEN {
                return Err(WireError::Protocol(format!(
                    "error message too large: {len} bytes"
                )));
            }
            let mut buf = vec![0u8; len as usize];
            reader.read_exact(&mut buf).await?;
            let message = String::from_utf8_lossy(&buf).into_owned();
            Err(WireError::Remote(message))
        }
        other => Err(WireError::Protocol(format!(
            "invalid response status byte: {other:#04x}"
        ))),
    }
}

/// Generates a fresh auth token: [`TOKEN_LEN`] lowercase hex
/// characters from the CSPRNG. One token is shared between a
/// [`ChunkServer`](crate::ChunkServer) and the clients uploading to it.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_LEN / 2];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Compares a received token against the expected one in constant
/// time, so the handshake leaks nothing through timing.
pub fn validate_token(received: &str, expected: &str) -> bool {
    received.len() == expected.len()
        && received
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}

/// Writes the authentication token (32 hex ASCII bytes).
pub async fn write_token<W: AsyncWrite + Unpin>(
    writer: &mut W,
    token: &str,
) -> Result<(), WireError> {
    if token.len() != TOKEN_LEN {
        return Err(WireError::Protocol(format!(
            "token must be {TOKEN_LEN} bytes, got {}",
            token.len()
        )));
    }
    writer.write_all(token.as_bytes()).await?;
    Ok(())
}

/// Reads the authentication token (32 hex ASCII bytes).
pub async fn read_token<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, WireError> {
    let mut buf = [0u8; TOKEN_LEN];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf.to_vec())
        .map_err(|e| WireError::Protocol(format!("invalid token encoding: {e}")))
}

/// Writes the authentication response byte.
pub async fn write_auth_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    accepted: bool,
) -> Result<(), WireError> {
    writer
        .write_u8(if accepted { AUTH_OK } else { AUTH_REJECTED })
        .await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the authentication response byte.
pub async fn read_auth_response<R: AsyncRead + Unpin>(reader: &mut R) -> Result<bool, WireError> {
    let byte = reader.read_u8().await?;
    Ok(byte == AUTH_OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkferry_protocol::{ChunkAck, ChunkHeader, StatusResponse};

    #[tokio::test]
    async fn json_frame_roundtrip() {
        let header = ChunkHeader {
            file_id: "abc123".into(),
            file_name: "video.mkv".into(),
            chunk_index: 3,
            total_chunks: 10,
            byte_offset: 3 * 8_388_608,
            byte_length: 8_388_608,
            checksum: "deadbeef".into(),
        };

        let mut buf = Vec::new();
        write_json_frame(&mut buf, &header).await.unwrap();

        let mut cursor = &buf[..];
        let parsed: ChunkHeader = read_json_frame(&mut cursor).await.unwrap();
        assert_eq!(parsed, header);
    }

    #[tokio::test]
    async fn ok_response_roundtrip() {
        let mut buf = Vec::new();
        write_ok_response(&mut buf, &ChunkAck::assembled())
            .await
            .unwrap();
        assert_eq!(buf[0], RESP_OK);

        let mut cursor = &buf[..];
        let ack: ChunkAck = read_response(&mut cursor).await.unwrap();
        assert!(ack.accepted);
        assert!(ack.assembled);
    }

    #[tokio::test]
    async fn error_response_surfaces_message() {
        let mut buf = Vec::new();
        write_error_response(&mut buf, "disk full").await.unwrap();
        assert_eq!(buf[0], RESP_ERROR);

        let mut cursor = &buf[..];
        let result: Result<StatusResponse, _> = read_response(&mut cursor).await;
        match result {
            Err(WireError::Remote(msg)) => assert_eq!(msg, "disk full"),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_status_byte_is_protocol_error() {
        let buf = [0x7Fu8];
        let mut cursor = &buf[..];
        let result: Result<ChunkAck, _> = read_response(&mut cursor).await;
        assert!(matches!(result, Err(WireError::Protocol(_))));
    }

    #[tokio::test]
    async fn oversized_frame_rejected_on_read() {
        let mut buf = Vec::new();
        tokio::io::AsyncWriteExt::write_u32(&mut buf, MAX_FRAME_LEN + 1)
            .await
            .unwrap();
        let mut cursor = &buf[..];
        let result: Result<ChunkAck, _> = read_json_frame(&mut cursor).await;
        assert!(matches!(result, Err(WireError::Protocol(_))));
    }

    #[tokio::test]
    async fn generated_token_survives_handshake_framing() {
        // A generated token is exactly what the framing expects: it
        // writes without a length error and reads back identically.
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

        let mut buf = Vec::new();
        write_token(&mut buf, &token).await.unwrap();

        let mut cursor = &buf[..];
        let parsed = read_token(&mut cursor).await.unwrap();
        assert_eq!(parsed, token);
        assert!(validate_token(&parsed, &token));
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(generate_token(), generate_token());
    }

    #[test]
    fn validation_rejects_wrong_or_truncated_tokens() {
        let expected = generate_token();
        assert!(validate_token(&expected, &expected));
        assert!(!validate_token(&generate_token(), &expected));
        assert!(!validate_token(&expected[..TOKEN_LEN - 1], &expected));
        assert!(!validate_token("", &expected));
    }

    #[tokio::test]
    async fn invalid_token_length() {
        let mut buf = Vec::new();
        assert!(write_token(&mut buf, "too_short").await.is_err());
    }

    #[tokio::test]
    async fn auth_response_roundtrip() {
        for accepted in [true, false] {
            let mut buf = Vec::new();
            write_auth_response(&mut buf, accepted).await.unwrap();

            let mut cursor = &buf[..];
            assert_eq!(read_auth_response(&mut cursor).await.unwrap(), accepted);
        }
    }
}
