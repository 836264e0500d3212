//! Auth handoff: one socket, two owners.
//!
//! The orchestrator dials the gateway's control socket, authenticates, and
//! — on success — keeps talking on the very same connection, now attached
//! to the freshly spawned worker. Three deadlines bound the exchange
//! (dial, write, read; the read materially larger to allow for slow
//! external credential checks); once the response says OK, no further
//! deadlines apply, because interactive sessions must not be
//! deadline-bound.
//!
//! Before anything dials, the worker binary on disk must hash to the
//! digest embedded at build time. A tampered or unknown binary is a fatal
//! refusal, logged with both digests.

use std::path::{Path, PathBuf};

use lio_core::config::{AUTH_READ_TIMEOUT, AUTH_WRITE_TIMEOUT, DIAL_TIMEOUT};
use lio_core::integrity;
use lio_core::wire::auth::{AuthRequest, AuthResponse, AuthStatus};
use lio_core::ProtocolError;
use secrecy::{ExposeSecret, SecretString};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{error, info};

use crate::error::BridgeError;

/// Worker digest embedded at build time.
///
/// Packaging sets `LIO_WORKER_SHA256` to the output of
/// `lio-worker --print-digest`; a build without it refuses to start
/// sessions at all.
pub const EMBEDDED_WORKER_DIGEST: Option<&str> = option_env!("LIO_WORKER_SHA256");

/// Everything the gateway needs to authenticate and spawn a worker.
pub struct AuthOptions {
    /// Username to authenticate.
    pub user: String,
    /// Password, handed to the gateway's external credential check.
    pub password: SecretString,
    /// Session id the orchestrator assigned.
    pub session_id: String,
    /// Request elevated rights; the gateway decides.
    pub privileged: bool,
    /// Request verbose worker logging.
    pub verbose: bool,
    /// Environment mode forwarded into the worker's bootstrap record.
    pub env_mode: u8,
    /// Path of the worker binary the gateway must spawn (and we verify).
    pub worker_path: PathBuf,
    /// Shared secret proving this orchestrator instance is the caller.
    pub secret: String,
    /// Orchestrator base URL forwarded to the worker.
    pub server_base_url: String,
    /// Orchestrator server certificate forwarded to the worker.
    pub server_cert: String,
}

impl AuthOptions {
    fn to_request(&self) -> AuthRequest {
        AuthRequest {
            verbose: self.verbose,
            privileged: self.privileged,
            env_mode: self.env_mode,
            user: self.user.clone(),
            password: self.password.expose_secret().clone(),
            session_id: self.session_id.clone(),
            bridge_path: self.worker_path.to_string_lossy().into_owned(),
            secret: self.secret.clone(),
            server_base_url: self.server_base_url.clone(),
            server_cert: self.server_cert.clone(),
        }
    }
}

/// A completed handoff: the connection now attached to the worker, plus
/// the gateway's response (mode and motd).
pub struct Handoff {
    /// The same connection that carried the auth exchange, deadline-free.
    pub conn: UnixStream,
    /// The gateway's OK response.
    pub response: AuthResponse,
}

/// Run the integrity check and the auth exchange.
///
/// # Errors
///
/// - [`BridgeError::Integrity`] before any dial if the worker binary does
///   not hash to `expected_digest` (or no digest is available)
/// - [`BridgeError::Protocol`] on dial/write/read failure, deadline
///   expiry, or a corrupt response (a corrupt response fails the attempt;
///   it is never retried on the same connection)
/// - [`BridgeError::Auth`] with the gateway's reason verbatim on
///   `status=error`
pub async fn start_handoff(
    control_socket: &Path,
    options: &AuthOptions,
    expected_digest: Option<&str>,
) -> Result<Handoff, BridgeError> {
    if let Err(err) = integrity::verify_binary(&options.worker_path, expected_digest) {
        error!(worker = %options.worker_path.display(), "worker integrity check failed: {err}");
        return Err(err.into());
    }

    let mut conn = timeout(DIAL_TIMEOUT, UnixStream::connect(control_socket))
        .await
        .map_err(|_| ProtocolError::Timeout {
            phase: "control socket dial",
            duration_ms: DIAL_TIMEOUT.as_millis() as u64,
        })?
        .map_err(ProtocolError::Io)?;

    let request = options.to_request();
    timeout(AUTH_WRITE_TIMEOUT, request.write_to(&mut conn))
        .await
        .map_err(|_| ProtocolError::Timeout {
            phase: "auth request write",
            duration_ms: AUTH_WRITE_TIMEOUT.as_millis() as u64,
        })??;

    let response = timeout(AUTH_READ_TIMEOUT, AuthResponse::read_from(&mut conn))
        .await
        .map_err(|_| ProtocolError::Timeout {
            phase: "auth response read",
            duration_ms: AUTH_READ_TIMEOUT.as_millis() as u64,
        })??;

    match response.status {
        AuthStatus::Ok => {
            info!(
                user = %options.user,
                session_id = %options.session_id,
                mode = ?response.mode,
                "auth handoff complete"
            );
            // From here the connection belongs to the worker session;
            // no further deadlines are applied to it.
            Ok(Handoff { conn, response })
        },
        AuthStatus::Error => Err(BridgeError::Auth {
            reason: response.message,
        }),
    }
}
