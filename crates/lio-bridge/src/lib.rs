//! lio-bridge - Orchestrator-side client for the LIO bridge.
//!
//! The unprivileged half of the pair: verifies the worker binary, performs
//! the auth handoff against the gateway's control socket, and turns the
//! handed-off connection into a multiplexed session that carries typed
//! calls, progress-reporting calls, and raw interactive streams.
//!
//! # Modules
//!
//! - [`error`]: bridge error taxonomy
//! - [`handoff`]: integrity check + auth exchange + connection handoff
//! - [`registry`]: the session directory (one live session per id)
//! - [`client`]: the three call shapes over a session
//! - [`progress`]: progress sink contract for long-running calls

pub mod client;
pub mod error;
pub mod handoff;
pub mod progress;
pub mod registry;

pub use client::{Bridge, BridgeConfig};
pub use error::BridgeError;
pub use handoff::{AuthOptions, EMBEDDED_WORKER_DIGEST, Handoff, start_handoff};
pub use progress::ProgressSink;
pub use registry::{SessionInfo, SessionRegistry};
