//! Socket paths and timeout budgets.
//!
//! Everything here is overridable through the environment so tests and
//! packaging can relocate the runtime directory, but the defaults match the
//! installed layout: a fixed control socket the gateway listens on, and one
//! socket per live session owned by that session's user.

use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the runtime directory.
pub const RUNTIME_DIR_ENV: &str = "LIO_RUNTIME_DIR";

/// Environment variable overriding the control socket path outright.
pub const CONTROL_SOCKET_ENV: &str = "LIO_CONTROL_SOCKET";

/// Default runtime directory when no override is present.
const DEFAULT_RUNTIME_DIR: &str = "/run/lio";

/// Control socket filename under the runtime directory.
const CONTROL_SOCKET_NAME: &str = "auth.sock";

/// File descriptor on which a freshly spawned worker inherits the
/// handed-off connection from the gateway.
///
/// Stdin (0) carries the bootstrap record and stderr (2) stays attached for
/// early startup failures, so the connection rides on the first free slot.
pub const HANDOFF_FD: RawFd = 3;

/// Bound on dialing the control socket.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on writing the auth request.
pub const AUTH_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on reading the auth response.
///
/// Materially larger than the write bound: the gateway may be waiting on a
/// slow external credential check before it can answer.
pub const AUTH_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on writing a call's opening request frame.
///
/// Steady-state interactive traffic is never deadline-bound; only the
/// opening write is, so a wedged session fails the call instead of
/// hanging it.
pub const CALL_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace window granted to in-flight handlers during worker shutdown.
/// Beyond it, teardown proceeds best-effort.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Runtime directory holding all bridge sockets.
#[must_use]
pub fn runtime_dir() -> PathBuf {
    std::env::var(RUNTIME_DIR_ENV)
        .map_or_else(|_| PathBuf::from(DEFAULT_RUNTIME_DIR), PathBuf::from)
}

/// Path of the fixed control socket the gateway accepts auth requests on.
#[must_use]
pub fn control_socket_path() -> PathBuf {
    std::env::var(CONTROL_SOCKET_ENV).map_or_else(
        |_| runtime_dir().join(CONTROL_SOCKET_NAME),
        PathBuf::from,
    )
}

/// Path of the per-session socket a worker owns for health checks and
/// re-attachment.
#[must_use]
pub fn session_socket_path(session_id: &str) -> PathBuf {
    runtime_dir().join(format!("session-{session_id}.sock"))
}
