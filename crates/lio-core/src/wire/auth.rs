//! Auth handoff request/response spoken over the control socket.
//!
//! One exchange per session start: the orchestrator writes an
//! [`AuthRequest`], the gateway verifies the credentials (outside this
//! crate), spawns the worker, and answers with an [`AuthResponse`]. On
//! `status=OK` the very same connection is thereafter attached to the
//! worker — the orchestrator never redials.
//!
//! # Wire Format
//!
//! ```text
//! AuthRequest:  magic(3)="LIO" version(1) flags(1) env_mode(1) reserved(2)
//!               user password sessionID bridgePath secret serverBaseURL serverCert
//! AuthResponse: magic(3)="LIO" version(1) status(1) mode(1) reserved(2)
//!               error (status=error) | motd (status=ok)
//! ```
//!
//! Integers big-endian; strings u16-prefixed UTF-8. Status: 0=OK, 1=error.
//! Mode: 0=unprivileged, 1=privileged. Flags as in the bootstrap record.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MAGIC, PROTOCOL_VERSION, ProtocolError, ProtocolResult};
use crate::wire::{check_preamble, put_string};

const FLAG_VERBOSE: u8 = 0b0000_0001;
const FLAG_PRIVILEGED: u8 = 0b0000_0010;

/// Outcome of the gateway's credential check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthStatus {
    /// Credentials accepted; a worker now owns the far end.
    Ok = 0,
    /// Credentials rejected or spawn failed; the tail carries the reason.
    Error = 1,
}

impl AuthStatus {
    fn from_byte(byte: u8) -> ProtocolResult<Self> {
        match byte {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Error),
            other => Err(ProtocolError::invalid_frame(format!(
                "unknown auth status {other}"
            ))),
        }
    }
}

/// Privilege level the gateway granted the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionMode {
    /// Ordinary user rights.
    Unprivileged = 0,
    /// Elevated rights granted by the credential check.
    Privileged = 1,
}

impl SessionMode {
    fn from_byte(byte: u8) -> ProtocolResult<Self> {
        match byte {
            0 => Ok(Self::Unprivileged),
            1 => Ok(Self::Privileged),
            other => Err(ProtocolError::invalid_frame(format!(
                "unknown session mode {other}"
            ))),
        }
    }

    /// Returns `true` for [`SessionMode::Privileged`].
    #[must_use]
    pub const fn is_privileged(self) -> bool {
        matches!(self, Self::Privileged)
    }
}

/// Credentials and session context sent to the gateway.
///
/// One-shot; the password is dropped with the value after the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// Request verbose logging in the spawned worker.
    pub verbose: bool,
    /// Request elevated rights (the gateway decides whether to grant them).
    pub privileged: bool,
    /// Environment mode forwarded into the worker's bootstrap record.
    pub env_mode: u8,
    /// Username to authenticate.
    pub user: String,
    /// Password, forwarded to the external credential check.
    pub password: String,
    /// Session identifier the orchestrator assigned.
    pub session_id: String,
    /// Filesystem path of the worker binary the gateway must spawn.
    pub bridge_path: String,
    /// Shared secret proving the orchestrator spawned this exchange.
    pub secret: String,
    /// Orchestrator base URL, forwarded into the bootstrap record.
    pub server_base_url: String,
    /// Orchestrator server certificate, forwarded likewise.
    pub server_cert: String,
}

impl AuthRequest {
    /// Serialize the request: 8-byte fixed header, then seven strings in
    /// strict order.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&MAGIC);
        buf.push(PROTOCOL_VERSION);
        let mut flags = 0u8;
        if self.verbose {
            flags |= FLAG_VERBOSE;
        }
        if self.privileged {
            flags |= FLAG_PRIVILEGED;
        }
        buf.push(flags);
        buf.push(self.env_mode);
        buf.extend_from_slice(&[0u8; 2]); // reserved
        put_string(&mut buf, &self.user);
        put_string(&mut buf, &self.password);
        put_string(&mut buf, &self.session_id);
        put_string(&mut buf, &self.bridge_path);
        put_string(&mut buf, &self.secret);
        put_string(&mut buf, &self.server_base_url);
        put_string(&mut buf, &self.server_cert);
        buf
    }

    /// Write the encoded request to `writer` and flush.
    ///
    /// # Errors
    ///
    /// Propagates the underlying I/O failure; the caller must abandon the
    /// connection on error rather than retry, since a partial header may
    /// already be on the wire.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> ProtocolResult<()> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read and validate one request (the gateway side of the exchange).
    ///
    /// # Errors
    ///
    /// Returns a protocol error on bad magic/version, short read, or
    /// malformed UTF-8.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> ProtocolResult<Self> {
        let mut header = [0u8; 8];
        read_exact_async(reader, &mut header, "auth request header").await?;
        check_preamble([header[0], header[1], header[2]], header[3])?;
        let flags = header[4];
        let env_mode = header[5];

        let user = read_string_async(reader, "user").await?;
        let password = read_string_async(reader, "password").await?;
        let session_id = read_string_async(reader, "session_id").await?;
        let bridge_path = read_string_async(reader, "bridge_path").await?;
        let secret = read_string_async(reader, "secret").await?;
        let server_base_url = read_string_async(reader, "server_base_url").await?;
        let server_cert = read_string_async(reader, "server_cert").await?;

        Ok(Self {
            verbose: flags & FLAG_VERBOSE != 0,
            privileged: flags & FLAG_PRIVILEGED != 0,
            env_mode,
            user,
            password,
            session_id,
            bridge_path,
            secret,
            server_base_url,
            server_cert,
        })
    }
}

/// The gateway's answer to an [`AuthRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    /// Whether the credential check succeeded.
    pub status: AuthStatus,
    /// Privilege level granted (meaningful only on success).
    pub mode: SessionMode,
    /// Error reason (status=error) or message of the day (status=ok).
    pub message: String,
}

impl AuthResponse {
    /// Successful response carrying the granted mode and an optional motd.
    #[must_use]
    pub fn ok(mode: SessionMode, motd: impl Into<String>) -> Self {
        Self {
            status: AuthStatus::Ok,
            mode,
            message: motd.into(),
        }
    }

    /// Rejection carrying the reason surfaced verbatim to the user.
    #[must_use]
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: AuthStatus::Error,
            mode: SessionMode::Unprivileged,
            message: reason.into(),
        }
    }

    /// Serialize the response: 8-byte fixed header, then the single
    /// message string.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.message.len());
        buf.extend_from_slice(&MAGIC);
        buf.push(PROTOCOL_VERSION);
        buf.push(self.status as u8);
        buf.push(self.mode as u8);
        buf.extend_from_slice(&[0u8; 2]); // reserved
        put_string(&mut buf, &self.message);
        buf
    }

    /// Write the encoded response to `writer` and flush.
    ///
    /// # Errors
    ///
    /// Propagates the underlying I/O failure.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> ProtocolResult<()> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read and validate one response (the orchestrator side).
    ///
    /// A corrupt response is a protocol error: the caller must treat the
    /// attempt as failed and close the connection, not retry on it.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on bad magic/version, unknown status or
    /// mode byte, short read, or malformed UTF-8.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> ProtocolResult<Self> {
        let mut header = [0u8; 8];
        read_exact_async(reader, &mut header, "auth response header").await?;
        check_preamble([header[0], header[1], header[2]], header[3])?;
        let status = AuthStatus::from_byte(header[4])?;
        let mode = SessionMode::from_byte(header[5])?;
        let message = read_string_async(reader, "message").await?;
        Ok(Self {
            status,
            mode,
            message,
        })
    }
}

async fn read_exact_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    field: &'static str,
) -> ProtocolResult<()> {
    reader.read_exact(buf).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::Truncated { field }
        } else {
            ProtocolError::Io(err)
        }
    })?;
    Ok(())
}

async fn read_string_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    field: &'static str,
) -> ProtocolResult<String> {
    let mut len_buf = [0u8; 2];
    read_exact_async(reader, &mut len_buf, field).await?;
    let len = usize::from(u16::from_be_bytes(len_buf));
    let mut bytes = vec![0u8; len];
    read_exact_async(reader, &mut bytes, field).await?;
    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8 { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> AuthRequest {
        AuthRequest {
            verbose: false,
            privileged: true,
            env_mode: 0,
            user: "alice".into(),
            password: "x".into(),
            session_id: "s1".into(),
            bridge_path: "/usr/libexec/lio-worker".into(),
            secret: "c2VjcmV0".into(),
            server_base_url: "https://host.example:8090".into(),
            server_cert: String::new(),
        }
    }

    #[tokio::test]
    async fn request_round_trip() {
        let request = sample_request();
        let bytes = request.encode();
        let decoded = AuthRequest::read_from(&mut bytes.as_slice()).await.unwrap();
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn response_round_trip_ok_and_error() {
        for response in [
            AuthResponse::ok(SessionMode::Privileged, "welcome back"),
            AuthResponse::error("authentication failure"),
        ] {
            let bytes = response.encode();
            let decoded = AuthResponse::read_from(&mut bytes.as_slice()).await.unwrap();
            assert_eq!(decoded, response);
        }
    }

    #[tokio::test]
    async fn fixed_headers_are_eight_bytes() {
        let response = AuthResponse::ok(SessionMode::Unprivileged, "");
        // 8-byte header + one empty u16 prefix.
        assert_eq!(response.encode().len(), 8 + 2);
    }

    #[tokio::test]
    async fn corrupt_response_magic_fails_cleanly() {
        let mut bytes = AuthResponse::ok(SessionMode::Privileged, "motd").encode();
        bytes[1] = b'Q';
        let result = AuthResponse::read_from(&mut bytes.as_slice()).await;
        assert!(matches!(result, Err(ProtocolError::BadMagic { .. })));
    }

    #[tokio::test]
    async fn unknown_status_byte_is_invalid_frame() {
        let mut bytes = AuthResponse::ok(SessionMode::Privileged, "").encode();
        bytes[4] = 7;
        let result = AuthResponse::read_from(&mut bytes.as_slice()).await;
        assert!(matches!(result, Err(ProtocolError::InvalidFrame { .. })));
    }

    #[tokio::test]
    async fn truncated_request_is_fatal() {
        let bytes = sample_request().encode();
        let result = AuthRequest::read_from(&mut bytes[..12].as_ref()).await;
        assert!(matches!(result, Err(ProtocolError::Truncated { .. })));
    }
}
