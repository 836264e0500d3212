//! Protocol error types shared by both ends of the bridge.
//!
//! Errors are structured so callers can branch on the failure class without
//! parsing message strings: a corrupt fixed header is fatal for the process
//! that reads it, while a timeout on the auth socket is merely a failed
//! attempt.

use std::io;

use thiserror::Error;

/// Magic bytes opening every fixed header.
pub const MAGIC: [u8; 3] = *b"LIO";

/// Wire protocol version carried in every fixed header.
///
/// Any other value is rejected outright; there is no negotiation. The two
/// binaries ship together, so a mismatch means a stale or foreign peer.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum relay frame payload in bytes (16 MiB).
///
/// Validated against the length prefix BEFORE allocation so a corrupt or
/// hostile peer cannot force memory exhaustion.
pub const MAX_RELAY_PAYLOAD: usize = 16 * 1024 * 1024;

/// Maximum encoded length of a length-prefixed string (u16 prefix).
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Errors raised by the wire codecs, the relay layer, and the handoff.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The fixed header did not start with the `LIO` magic.
    #[error("bad magic: expected \"LIO\", found {found:02x?}")]
    BadMagic {
        /// The three bytes actually read.
        found: [u8; 3],
    },

    /// The fixed header carried an unsupported protocol version.
    #[error("unsupported protocol version {found}, this build speaks {PROTOCOL_VERSION}")]
    UnsupportedVersion {
        /// The version byte actually read.
        found: u8,
    },

    /// A length prefix announced a payload larger than the permitted cap.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Size announced by the length prefix.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A frame or record did not match the expected structure.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// Description of the defect.
        reason: String,
    },

    /// The input ended mid-record.
    ///
    /// A short read of a fixed header or a length-prefixed field is fatal
    /// for the reader: the record cannot be partially consumed and retried.
    #[error("truncated input while reading {field}")]
    Truncated {
        /// Name of the field being read when the input ran out.
        field: &'static str,
    },

    /// A length-prefixed string was not valid UTF-8.
    #[error("field {field} is not valid UTF-8")]
    InvalidUtf8 {
        /// Name of the offending field.
        field: &'static str,
    },

    /// A phase of the auth handoff exceeded its deadline.
    #[error("{phase} timed out after {duration_ms} ms")]
    Timeout {
        /// The phase that expired (dial, write, read).
        phase: &'static str,
        /// Budget that was exceeded, in milliseconds.
        duration_ms: u64,
    },

    /// Underlying transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Create a frame-too-large error against [`MAX_RELAY_PAYLOAD`].
    #[must_use]
    pub const fn frame_too_large(size: usize) -> Self {
        Self::FrameTooLarge {
            size,
            max: MAX_RELAY_PAYLOAD,
        }
    }

    /// Create an invalid-frame error.
    #[must_use]
    pub fn invalid_frame(reason: impl Into<String>) -> Self {
        Self::InvalidFrame {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error means the peer spoke a different or
    /// corrupted protocol.
    ///
    /// Protocol violations are fatal for the in-flight exchange: the
    /// connection must be torn down, and a Worker that sees one while
    /// reading its bootstrap record must exit.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::BadMagic { .. }
                | Self::UnsupportedVersion { .. }
                | Self::FrameTooLarge { .. }
                | Self::InvalidFrame { .. }
                | Self::Truncated { .. }
                | Self::InvalidUtf8 { .. }
        )
    }

    /// Returns `true` for transient transport-level failures where a fresh
    /// attempt on a fresh connection may succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Io(_))
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_magic_is_protocol_violation() {
        let err = ProtocolError::BadMagic { found: *b"XYZ" };
        assert!(err.is_protocol_violation());
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("LIO"));
    }

    #[test]
    fn timeout_is_recoverable() {
        let err = ProtocolError::Timeout {
            phase: "dial",
            duration_ms: 5000,
        };
        assert!(err.is_recoverable());
        assert!(!err.is_protocol_violation());
        assert!(err.to_string().contains("5000"));
    }

    #[test]
    fn frame_too_large_reports_both_sizes() {
        let err = ProtocolError::frame_too_large(20_000_000);
        assert!(err.is_protocol_violation());
        let msg = err.to_string();
        assert!(msg.contains("20000000"));
        assert!(msg.contains(&MAX_RELAY_PAYLOAD.to_string()));
    }

    #[test]
    fn io_errors_are_not_violations() {
        let err = ProtocolError::from(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(!err.is_protocol_violation());
        assert!(err.is_recoverable());
    }
}
