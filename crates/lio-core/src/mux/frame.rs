//! Multiplexer wire frames.
//!
//! The layer beneath the relay protocol: every byte on the handed-off
//! connection is one of these frames. Same header shape as a relay frame
//! (type, stream id, length, payload) so the two layers read alike in a
//! packet capture, but the type space is the multiplexer's own.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, ProtocolResult};

/// Hard cap on one multiplexer frame payload.
///
/// Writers chunk at the configured frame size well below this; the cap only
/// bounds what a reader will allocate for a corrupt or hostile peer.
pub const MAX_MUX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Multiplexer frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Open a logical stream.
    Syn = 1,
    /// Payload bytes on an open stream.
    Data = 2,
    /// Half-close: the sender will write no more on this stream.
    Fin = 3,
    /// Flow-control credit grant; payload is a 4-byte delta.
    Window = 4,
    /// Keepalive probe; payload is a 4-byte token echoed back.
    Ping = 5,
    /// Keepalive answer.
    Pong = 6,
    /// Session teardown announcement.
    GoAway = 7,
}

impl FrameType {
    fn from_byte(byte: u8) -> ProtocolResult<Self> {
        match byte {
            1 => Ok(Self::Syn),
            2 => Ok(Self::Data),
            3 => Ok(Self::Fin),
            4 => Ok(Self::Window),
            5 => Ok(Self::Ping),
            6 => Ok(Self::Pong),
            7 => Ok(Self::GoAway),
            other => Err(ProtocolError::invalid_frame(format!(
                "unknown mux frame type {other}"
            ))),
        }
    }
}

/// One multiplexer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxFrame {
    /// Frame type.
    pub frame_type: FrameType,
    /// Logical stream id; 0 for session-level frames (ping/pong/goaway).
    pub stream_id: u32,
    /// Frame payload.
    pub payload: Bytes,
}

impl MuxFrame {
    /// Frame with no payload.
    #[must_use]
    pub fn bare(frame_type: FrameType, stream_id: u32) -> Self {
        Self {
            frame_type,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Data frame.
    #[must_use]
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            stream_id,
            payload,
        }
    }

    /// Window-update frame granting `delta` bytes of credit.
    #[must_use]
    pub fn window(stream_id: u32, delta: u32) -> Self {
        Self {
            frame_type: FrameType::Window,
            stream_id,
            payload: Bytes::copy_from_slice(&delta.to_be_bytes()),
        }
    }

    /// Ping frame carrying `token`.
    #[must_use]
    pub fn ping(token: u32) -> Self {
        Self {
            frame_type: FrameType::Ping,
            stream_id: 0,
            payload: Bytes::copy_from_slice(&token.to_be_bytes()),
        }
    }

    /// Pong frame echoing `token`.
    #[must_use]
    pub fn pong(token: u32) -> Self {
        Self {
            frame_type: FrameType::Pong,
            stream_id: 0,
            payload: Bytes::copy_from_slice(&token.to_be_bytes()),
        }
    }

    /// Decode the 4-byte big-endian value carried by window/ping/pong
    /// frames.
    ///
    /// # Errors
    ///
    /// Returns an invalid-frame error if the payload is not exactly four
    /// bytes.
    pub fn u32_payload(&self) -> ProtocolResult<u32> {
        let bytes: [u8; 4] = self.payload.as_ref().try_into().map_err(|_| {
            ProtocolError::invalid_frame(format!(
                "{:?} frame payload must be 4 bytes, got {}",
                self.frame_type,
                self.payload.len()
            ))
        })?;
        Ok(u32::from_be_bytes(bytes))
    }
}

/// Write one frame and flush.
///
/// # Errors
///
/// Propagates the transport failure.
pub async fn write_mux_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &MuxFrame,
) -> ProtocolResult<()> {
    let mut header = [0u8; 9];
    header[0] = frame.frame_type as u8;
    header[1..5].copy_from_slice(&frame.stream_id.to_be_bytes());
    #[allow(clippy::cast_possible_truncation)]
    let len = frame.payload.len() as u32;
    header[5..9].copy_from_slice(&len.to_be_bytes());
    writer.write_all(&header).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one full frame, validating the length prefix before allocation.
///
/// # Errors
///
/// Returns a protocol error on an unknown type byte or an over-cap length,
/// and I/O errors (including `UnexpectedEof` on peer close) otherwise.
pub async fn read_mux_frame<R: AsyncRead + Unpin>(reader: &mut R) -> ProtocolResult<MuxFrame> {
    let mut header = [0u8; 9];
    reader.read_exact(&mut header).await?;
    let frame_type = FrameType::from_byte(header[0])?;
    let stream_id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
    if len > MAX_MUX_PAYLOAD {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_MUX_PAYLOAD,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(MuxFrame {
        frame_type,
        stream_id,
        payload: Bytes::from(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = MuxFrame::data(11, Bytes::from_static(b"chunk"));
        write_mux_frame(&mut a, &frame).await.unwrap();
        assert_eq!(read_mux_frame(&mut b).await.unwrap(), frame);
    }

    #[tokio::test]
    async fn window_payload_decodes() {
        let frame = MuxFrame::window(4, 65536);
        assert_eq!(frame.u32_payload().unwrap(), 65536);
    }

    #[tokio::test]
    async fn malformed_window_payload_is_invalid() {
        let frame = MuxFrame {
            frame_type: FrameType::Window,
            stream_id: 4,
            payload: Bytes::from_static(b"xyz"),
        };
        assert!(frame.u32_payload().is_err());
    }

    #[tokio::test]
    async fn unknown_type_byte_is_invalid() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut header = [0u8; 9];
        header[0] = 42;
        tokio::io::AsyncWriteExt::write_all(&mut a, &header)
            .await
            .unwrap();
        assert!(matches!(
            read_mux_frame(&mut b).await,
            Err(ProtocolError::InvalidFrame { .. })
        ));
    }
}
