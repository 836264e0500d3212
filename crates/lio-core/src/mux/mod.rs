//! Stream multiplexer: many logical streams over one connection.
//!
//! The auth handoff leaves both sides holding exactly one Unix socket
//! connection. Everything after that — concurrent calls, log tails,
//! terminal I/O, file transfers — shares it through this multiplexer.
//!
//! # Module Overview
//!
//! - [`frame`]: the multiplexer's own wire frames (SYN/DATA/FIN/WINDOW/
//!   PING/PONG/GOAWAY)
//! - [`session`]: session lifecycle, background tasks, close callback
//! - [`stream`]: per-stream `AsyncRead`/`AsyncWrite` handles
//!
//! # Flow Control
//!
//! Credit-based, per stream: a writer may have at most one window of bytes
//! outstanding, and the reader grants fresh credit as its consumer drains
//! the buffer. The default window is generous enough for multi-megabyte
//! file-transfer chunks, so bulk streams make progress without starving
//! interactive siblings on the same connection.

pub mod frame;
pub mod session;
pub mod stream;

use std::io;
use std::time::Duration;

use thiserror::Error;

pub use frame::{FrameType, MuxFrame};
pub use session::MuxSession;
pub use stream::MuxStream;

/// Default per-stream flow-control window (4 MiB).
pub const DEFAULT_STREAM_WINDOW: u32 = 4 * 1024 * 1024;

/// Default write chunk size (64 KiB).
pub const DEFAULT_FRAME_PAYLOAD: u32 = 64 * 1024;

/// Default pending-stream backlog.
pub const DEFAULT_ACCEPT_BACKLOG: usize = 256;

/// Default keepalive interval.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Session tuning knobs.
///
/// Both binaries ship together and construct their sessions from the same
/// defaults; the initial stream credit on one side must match the window
/// on the other.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Ping interval; `None` disables keepalive entirely.
    pub keepalive_interval: Option<Duration>,
    /// Maximum inbound streams awaiting `accept_stream`.
    pub accept_backlog: usize,
    /// Per-stream flow-control window in bytes.
    pub stream_window: u32,
    /// Largest data frame a writer emits in one piece.
    pub frame_payload: u32,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Some(DEFAULT_KEEPALIVE_INTERVAL),
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            stream_window: DEFAULT_STREAM_WINDOW,
            frame_payload: DEFAULT_FRAME_PAYLOAD,
        }
    }
}

/// Multiplexer session errors.
#[derive(Debug, Error)]
pub enum MuxError {
    /// The session has closed; no further streams can be opened.
    #[error("multiplexer session is closed")]
    SessionClosed,

    /// Transport failure underneath the session.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
