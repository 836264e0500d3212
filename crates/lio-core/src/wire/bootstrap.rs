//! Bootstrap record handed from the gateway to a freshly spawned worker.
//!
//! The record travels exactly once, over the worker's stdin, before the
//! async runtime exists. It is the worker's only source of identity: no
//! environment variables (visible in `/proc`), no config file (racy between
//! spawn and first read). A worker that cannot read a well-formed record
//! must exit immediately — it does not know who it is.
//!
//! # Wire Format
//!
//! ```text
//! magic(3)="LIO"  version(1)  uid(4)  gid(4)  flags(1)  env_mode(1)  log_fd(4)
//! sessionID  username  serverBaseURL  serverCert      (u16-prefixed strings)
//! ```
//!
//! All integers big-endian. Flags: bit 0 = verbose, bit 1 = privileged.

use std::io::Read;

use crate::error::{MAGIC, PROTOCOL_VERSION, ProtocolResult};
use crate::wire::{check_preamble, put_string, read_exact, read_string};

/// Flag bit: verbose logging requested for this worker.
const FLAG_VERBOSE: u8 = 0b0000_0001;

/// Flag bit: the session holds elevated rights.
const FLAG_PRIVILEGED: u8 = 0b0000_0010;

/// Identity and session context for one worker process.
///
/// Consumed once at startup and then owned by the dispatch loop; never
/// re-read, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootstrap {
    /// Uid the worker runs as.
    pub uid: u32,
    /// Gid the worker runs as.
    pub gid: u32,
    /// Verbose logging requested.
    pub verbose: bool,
    /// The session was granted elevated rights.
    pub privileged: bool,
    /// Environment mode discriminant (production, development, ...).
    /// Opaque at this layer; forwarded to handlers that care.
    pub env_mode: u8,
    /// File descriptor the gateway left open for log forwarding.
    pub log_fd: i32,
    /// Session identifier assigned by the orchestrator.
    pub session_id: String,
    /// Username the session authenticated as.
    pub username: String,
    /// Base URL of the orchestrator's own server, for callbacks.
    pub server_base_url: String,
    /// PEM certificate of the orchestrator's server, empty if none.
    pub server_cert: String,
}

impl Bootstrap {
    /// Serialize the record for writing to a worker's stdin.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            18 + 8
                + self.session_id.len()
                + self.username.len()
                + self.server_base_url.len()
                + self.server_cert.len(),
        );
        buf.extend_from_slice(&MAGIC);
        buf.push(PROTOCOL_VERSION);
        buf.extend_from_slice(&self.uid.to_be_bytes());
        buf.extend_from_slice(&self.gid.to_be_bytes());
        let mut flags = 0u8;
        if self.verbose {
            flags |= FLAG_VERBOSE;
        }
        if self.privileged {
            flags |= FLAG_PRIVILEGED;
        }
        buf.push(flags);
        buf.push(self.env_mode);
        buf.extend_from_slice(&self.log_fd.to_be_bytes());
        put_string(&mut buf, &self.session_id);
        put_string(&mut buf, &self.username);
        put_string(&mut buf, &self.server_base_url);
        put_string(&mut buf, &self.server_cert);
        buf
    }

    /// Read and validate one bootstrap record.
    ///
    /// The fixed 18-byte header is read in full and validated before any
    /// variable field is attempted; the four strings then follow in strict
    /// order. Any mismatch or short read is fatal for the caller — there is
    /// no recovery path, because a worker without a valid record has no
    /// identity to fall back on.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::ProtocolError`] on bad magic, unsupported
    /// version, short read, or malformed UTF-8 in any string field.
    pub fn read_from(reader: &mut impl Read) -> ProtocolResult<Self> {
        let mut header = [0u8; 18];
        read_exact(reader, &mut header, "bootstrap header")?;
        check_preamble([header[0], header[1], header[2]], header[3])?;

        let uid = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let gid = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        let flags = header[12];
        let env_mode = header[13];
        let log_fd = i32::from_be_bytes([header[14], header[15], header[16], header[17]]);

        let session_id = read_string(reader, "session_id")?;
        let username = read_string(reader, "username")?;
        let server_base_url = read_string(reader, "server_base_url")?;
        let server_cert = read_string(reader, "server_cert")?;

        Ok(Self {
            uid,
            gid,
            verbose: flags & FLAG_VERBOSE != 0,
            privileged: flags & FLAG_PRIVILEGED != 0,
            env_mode,
            log_fd,
            session_id,
            username,
            server_base_url,
            server_cert,
        })
    }
}
