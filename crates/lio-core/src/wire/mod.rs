//! One-shot binary records exchanged around process spawn.
//!
//! Two records live here: the [`bootstrap`] record a gateway writes to a
//! freshly spawned worker's stdin, and the [`auth`] request/response pair
//! spoken over the control socket. Both share the same primitive shapes:
//! big-endian integers, a 3-byte magic plus version byte, and u16
//! length-prefixed UTF-8 strings.
//!
//! Strings longer than the u16 cap are truncated by the encoder, never
//! rejected; the cut falls on the last character boundary at or below the
//! cap so the decoded value is always valid UTF-8.

pub mod auth;
pub mod bootstrap;

use std::io::Read;

use crate::error::{MAX_STRING_LEN, ProtocolError, ProtocolResult};

/// Append a u16 length-prefixed UTF-8 string, truncating at the cap.
pub(crate) fn put_string(buf: &mut Vec<u8>, value: &str) {
    let bytes = truncate_to_cap(value).as_bytes();
    debug_assert!(bytes.len() <= MAX_STRING_LEN);
    buf.extend_from_slice(&u16::try_from(bytes.len()).unwrap_or(u16::MAX).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// The longest prefix of `value` that fits the u16 length prefix without
/// splitting a character.
pub(crate) fn truncate_to_cap(value: &str) -> &str {
    if value.len() <= MAX_STRING_LEN {
        return value;
    }
    let mut end = MAX_STRING_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Read exactly `buf.len()` bytes, reporting a short read as a truncated
/// `field`.
pub(crate) fn read_exact(
    reader: &mut impl Read,
    buf: &mut [u8],
    field: &'static str,
) -> ProtocolResult<()> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::Truncated { field }
        } else {
            ProtocolError::Io(err)
        }
    })
}

/// Read one u16 length-prefixed UTF-8 string.
pub(crate) fn read_string(reader: &mut impl Read, field: &'static str) -> ProtocolResult<String> {
    let mut len_buf = [0u8; 2];
    read_exact(reader, &mut len_buf, field)?;
    let len = usize::from(u16::from_be_bytes(len_buf));
    let mut bytes = vec![0u8; len];
    read_exact(reader, &mut bytes, field)?;
    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8 { field })
}

/// Validate the shared magic + version prefix of a fixed header.
pub(crate) fn check_preamble(magic: [u8; 3], version: u8) -> ProtocolResult<()> {
    if magic != crate::error::MAGIC {
        return Err(ProtocolError::BadMagic { found: magic });
    }
    if version != crate::error::PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion { found: version });
    }
    Ok(())
}
