//! Relay frame envelope spoken inside every logical stream.
//!
//! One frame format carries everything a stream ever says: JSON call
//! requests and replies, progress ticks, raw terminal bytes, file chunks.
//! A stream opens implicitly with its initiator's first data frame (a
//! [`CallRequest`]), exchanges zero or more data frames, and ends with
//! exactly one terminal event: a result frame followed by a close frame,
//! or a close frame alone for raw byte streams.
//!
//! # Wire Format
//!
//! ```text
//! +--------+---------------+---------------+----------+
//! | op (1) | stream id (4) | length (4)    | payload  |
//! +--------+---------------+---------------+----------+
//! ```
//!
//! Big-endian integers; payload capped at [`MAX_RELAY_PAYLOAD`], validated
//! before allocation.
//!
//! The close frame is always explicit. Streams may stay open on the
//! multiplexer for unrelated control traffic after a result, so transport
//! EOF never substitutes for a close frame.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MAX_RELAY_PAYLOAD, ProtocolError, ProtocolResult};

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Payload bytes: a call request, progress tick, or raw data chunk.
    Data = 1,
    /// Zero-payload terminal marker.
    Close = 2,
    /// Structured result ending a call (payload is a [`ResultFrame`]).
    Result = 3,
}

impl Opcode {
    fn from_byte(byte: u8) -> ProtocolResult<Self> {
        match byte {
            1 => Ok(Self::Data),
            2 => Ok(Self::Close),
            3 => Ok(Self::Result),
            other => Err(ProtocolError::invalid_frame(format!(
                "unknown relay opcode {other}"
            ))),
        }
    }
}

/// One relay frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    /// Frame opcode.
    pub opcode: Opcode,
    /// Logical stream the frame belongs to, assigned by the initiator.
    pub stream_id: u32,
    /// Frame payload; empty for close frames.
    pub payload: Bytes,
}

impl RelayFrame {
    /// A data frame.
    #[must_use]
    pub fn data(stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::Data,
            stream_id,
            payload: payload.into(),
        }
    }

    /// A zero-payload close frame.
    #[must_use]
    pub fn close(stream_id: u32) -> Self {
        Self {
            opcode: Opcode::Close,
            stream_id,
            payload: Bytes::new(),
        }
    }
}

/// First message on every stream: names the handler and its arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallRequest {
    /// Handler group, e.g. "control", "terminal", "docker".
    pub group: String,
    /// Command within the group.
    pub command: String,
    /// Handler arguments, opaque at this layer.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub args: serde_json::Value,
}

impl CallRequest {
    /// Build a request with JSON arguments.
    #[must_use]
    pub fn new(group: impl Into<String>, command: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            group: group.into(),
            command: command.into(),
            args,
        }
    }
}

/// Structured result terminating a call.
///
/// `status` is `"ok"` on success and the error message otherwise; `code`
/// carries HTTP-like semantics (400 bad arguments, 404 unknown command,
/// 500 handler failure) independent of transport status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultFrame {
    /// `"ok"` or the handler's error message.
    pub status: String,
    /// HTTP-like status code.
    pub code: u16,
    /// Opaque structured payload.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl ResultFrame {
    /// Success marker used in `status`.
    pub const STATUS_OK: &'static str = "ok";

    /// Successful result with payload.
    #[must_use]
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: Self::STATUS_OK.to_string(),
            code: 200,
            data,
        }
    }

    /// Failed result with HTTP-like code and message.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            status: message.into(),
            code,
            data: serde_json::Value::Null,
        }
    }

    /// Returns `true` if the call succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == Self::STATUS_OK
    }
}

/// Progress tick interleaved with a long-running call's data frames.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ProgressTick {
    /// Completion percentage, 0.0 to 100.0.
    pub percent: f64,
    /// Bytes processed so far.
    pub bytes_processed: u64,
    /// Total bytes expected, 0 if unknown.
    pub total_bytes: u64,
}

/// Write one frame and flush.
///
/// Blocks until the frame is fully written or the stream errors. A failure
/// here may leave a partial frame on the wire: the caller must abandon and
/// close the stream, never retry the write.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if the payload exceeds the cap,
/// otherwise propagates the transport failure.
pub async fn write_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    frame: &RelayFrame,
) -> ProtocolResult<()> {
    if frame.payload.len() > MAX_RELAY_PAYLOAD {
        return Err(ProtocolError::frame_too_large(frame.payload.len()));
    }
    let mut header = [0u8; 9];
    header[0] = frame.opcode as u8;
    header[1..5].copy_from_slice(&frame.stream_id.to_be_bytes());
    #[allow(clippy::cast_possible_truncation)]
    let len = frame.payload.len() as u32;
    header[5..9].copy_from_slice(&len.to_be_bytes());
    stream.write_all(&header).await?;
    stream.write_all(&frame.payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one full frame.
///
/// Blocks until a frame is available. Peer close at a frame boundary
/// surfaces as an I/O error with `UnexpectedEof`; a close mid-frame is a
/// protocol violation.
///
/// # Errors
///
/// Returns a protocol error on an unknown opcode or an over-cap length
/// prefix (checked before allocation), and I/O errors from the transport.
pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> ProtocolResult<RelayFrame> {
    let mut header = [0u8; 9];
    stream.read_exact(&mut header).await?;
    let opcode = Opcode::from_byte(header[0])?;
    let stream_id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
    if len > MAX_RELAY_PAYLOAD {
        return Err(ProtocolError::frame_too_large(len));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::Truncated {
                field: "relay frame payload",
            }
        } else {
            ProtocolError::Io(err)
        }
    })?;
    Ok(RelayFrame {
        opcode,
        stream_id,
        payload: Bytes::from(payload),
    })
}

/// Write a zero-payload close frame.
///
/// # Errors
///
/// Propagates the transport failure.
pub async fn write_close<S: AsyncWrite + Unpin>(
    stream: &mut S,
    stream_id: u32,
) -> ProtocolResult<()> {
    write_frame(stream, &RelayFrame::close(stream_id)).await
}

/// Write a result frame, then the mandatory close frame.
///
/// # Errors
///
/// Propagates serialization and transport failures.
pub async fn write_result<S: AsyncWrite + Unpin>(
    stream: &mut S,
    stream_id: u32,
    result: &ResultFrame,
) -> ProtocolResult<()> {
    let payload = serde_json::to_vec(result)
        .map_err(|err| ProtocolError::invalid_frame(format!("result encode: {err}")))?;
    write_frame(
        stream,
        &RelayFrame {
            opcode: Opcode::Result,
            stream_id,
            payload: Bytes::from(payload),
        },
    )
    .await?;
    write_close(stream, stream_id).await
}

/// Write an error result frame, then the mandatory close frame.
///
/// # Errors
///
/// Propagates serialization and transport failures.
pub async fn write_result_error<S: AsyncWrite + Unpin>(
    stream: &mut S,
    stream_id: u32,
    code: u16,
    message: impl Into<String>,
) -> ProtocolResult<()> {
    write_result(stream, stream_id, &ResultFrame::error(code, message)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let frame = RelayFrame::data(7, &b"hello"[..]);
        write_frame(&mut client, &frame).await.unwrap();
        let read = read_frame(&mut server).await.unwrap();
        assert_eq!(read, frame);
    }

    #[tokio::test]
    async fn close_frame_has_empty_payload() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_close(&mut client, 3).await.unwrap();
        let read = read_frame(&mut server).await.unwrap();
        assert_eq!(read.opcode, Opcode::Close);
        assert_eq!(read.stream_id, 3);
        assert!(read.payload.is_empty());
    }

    #[tokio::test]
    async fn result_is_followed_by_close() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_result(&mut client, 1, &ResultFrame::ok(serde_json::json!({"pong": true})))
            .await
            .unwrap();

        let first = read_frame(&mut server).await.unwrap();
        assert_eq!(first.opcode, Opcode::Result);
        let result: ResultFrame = serde_json::from_slice(&first.payload).unwrap();
        assert!(result.is_ok());
        assert_eq!(result.code, 200);

        let second = read_frame(&mut server).await.unwrap();
        assert_eq!(second.opcode, Opcode::Close);
    }

    #[tokio::test]
    async fn error_result_carries_code_and_message() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_result_error(&mut client, 1, 404, "unknown command docker/nope")
            .await
            .unwrap();
        let frame = read_frame(&mut server).await.unwrap();
        let result: ResultFrame = serde_json::from_slice(&frame.payload).unwrap();
        assert!(!result.is_ok());
        assert_eq!(result.code, 404);
        assert!(result.status.contains("unknown"));
    }

    #[tokio::test]
    async fn oversized_length_prefix_rejected_before_allocation() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut header = [0u8; 9];
        header[0] = Opcode::Data as u8;
        header[5..9].copy_from_slice(&u32::MAX.to_be_bytes());
        tokio::io::AsyncWriteExt::write_all(&mut client, &header)
            .await
            .unwrap();
        let result = read_frame(&mut server).await;
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn unknown_opcode_is_invalid_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut header = [0u8; 9];
        header[0] = 9;
        tokio::io::AsyncWriteExt::write_all(&mut client, &header)
            .await
            .unwrap();
        let result = read_frame(&mut server).await;
        assert!(matches!(result, Err(ProtocolError::InvalidFrame { .. })));
    }

    #[tokio::test]
    async fn peer_close_surfaces_as_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let result = read_frame(&mut server).await;
        match result {
            Err(ProtocolError::Io(err)) => {
                assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
            },
            other => panic!("expected EOF error, got {other:?}"),
        }
    }

    #[test]
    fn call_request_serializes_compactly() {
        let request = CallRequest::new("control", "ping", serde_json::Value::Null);
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("args"));
        let back: CallRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
    }
}
