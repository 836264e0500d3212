//! lio-worker - Per-session privileged worker for the LIO bridge.
//!
//! One worker process exists per authenticated session. The gateway spawns
//! it with the session's uid/gid, writes a bootstrap record to its stdin,
//! and hands it the orchestrator's connection on a reserved file
//! descriptor. From then on the worker answers multiplexed calls until the
//! session logs out, the orchestrator vanishes, or a shutdown command
//! arrives.
//!
//! # Modules
//!
//! - [`context`]: per-process identity and shutdown signal
//! - [`registry`]: handler registry with privilege gating
//! - [`dispatch`]: the accept/dispatch loop
//! - [`socket`]: handed-off connection adoption and the per-session socket
//! - [`credentials`]: `SO_PEERCRED` peer validation
//! - [`handlers`]: built-in control handlers
//! - [`streams`]: interactive stream handlers (terminal, logs, exec, file)

pub mod context;
pub mod credentials;
pub mod dispatch;
pub mod handlers;
pub mod registry;
pub mod socket;
pub mod streams;

pub use context::{ShutdownReason, ShutdownSignal, WorkerContext};
pub use dispatch::Dispatcher;
pub use registry::{HandlerError, HandlerRegistry, JsonHandler, StreamHandler};
