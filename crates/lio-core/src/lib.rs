//! lio-core - Wire protocols and shared plumbing for the LIO bridge.
//!
//! This crate carries everything both sides of the bridge agree on: the
//! binary handoff formats, the relay frame envelope spoken inside every
//! logical stream, the stream multiplexer that turns one Unix socket into
//! many independent streams, and the integrity check applied to the worker
//! binary before it is ever launched.
//!
//! # Architecture
//!
//! The protocol stack is organized in layers:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Handler calls / raw bytes         │  JSON args + results
//! ├─────────────────────────────────────────┤
//! │            Relay frames                  │  data / result / close
//! ├─────────────────────────────────────────┤
//! │         Multiplexed streams              │  SYN/DATA/FIN/WINDOW
//! ├─────────────────────────────────────────┤
//! │  One handed-off Unix socket connection   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The one-shot [`wire::bootstrap`] and [`wire::auth`] records sit outside
//! this stack: they run once, before the multiplexer exists.
//!
//! # Module Overview
//!
//! - [`error`]: Protocol error types ([`ProtocolError`], [`ProtocolResult`])
//! - [`config`]: Socket paths and timeout budgets
//! - [`wire`]: Bootstrap and auth handoff binary records
//! - [`relay`]: Relay frame envelope and result frames
//! - [`mux`]: Stream multiplexer session over one connection
//! - [`integrity`]: Worker binary digest verification

pub mod config;
pub mod error;
pub mod integrity;
pub mod mux;
pub mod relay;
pub mod wire;

pub use error::{
    MAGIC, MAX_RELAY_PAYLOAD, PROTOCOL_VERSION, ProtocolError, ProtocolResult,
};
pub use relay::{Opcode, RelayFrame, ResultFrame};
pub use wire::auth::{AuthRequest, AuthResponse, AuthStatus, SessionMode};
pub use wire::bootstrap::Bootstrap;
