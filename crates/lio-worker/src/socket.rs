//! Socket plumbing: adopting the handed-off connection and owning the
//! per-session Unix socket.
//!
//! The per-session socket exists beside the handed-off connection, for
//! health checks and re-attachment. Only the session's own user may
//! connect: the socket file is mode 0600 and every accepted peer is
//! checked against the worker's uid via `SO_PEERCRED`.

use std::io;
use std::os::fd::FromRawFd;
use std::path::{Path, PathBuf};

use lio_core::config::{HANDOFF_FD, session_socket_path};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::credentials::PeerCredentials;

/// Socket file permissions: owner only.
const SOCKET_MODE: u32 = 0o600;

/// Runtime directory permissions when we create it.
const DIRECTORY_MODE: u32 = 0o700;

/// Adopt the connection the gateway left open on [`HANDOFF_FD`].
///
/// Must be called exactly once, before anything else could have touched
/// that descriptor.
///
/// # Errors
///
/// Returns an I/O error if the descriptor is not a connected socket or
/// cannot be switched to non-blocking mode.
pub fn take_handoff_socket() -> io::Result<UnixStream> {
    // SAFETY: the gateway spawns us with the handed-off connection on
    // HANDOFF_FD and nothing else in this process uses that descriptor.
    // This is the single point of adoption.
    let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(HANDOFF_FD) };
    std_stream.set_nonblocking(true)?;
    UnixStream::from_std(std_stream)
}

/// The worker's own listening socket, bound to the session socket path.
pub struct SessionSocket {
    listener: UnixListener,
    path: PathBuf,
    owner_uid: u32,
}

impl SessionSocket {
    /// Bind the per-session socket for `session_id`.
    ///
    /// Creates the runtime directory if missing (0700, refusing symlinks),
    /// removes a stale socket file from a previous incarnation, binds, and
    /// tightens the socket file to 0600.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory is unusable, the stale path is
    /// not a socket, or binding fails.
    pub fn bind(session_id: &str, owner_uid: u32) -> io::Result<Self> {
        let path = session_socket_path(session_id);
        if let Some(parent) = path.parent() {
            ensure_directory(parent)?;
        }
        cleanup_socket(&path)?;

        let listener = UnixListener::bind(&path)?;
        set_permissions(&path, SOCKET_MODE)?;

        info!(path = %path.display(), "session socket bound");
        Ok(Self {
            listener,
            path,
            owner_uid,
        })
    }

    /// Accept the next connection from the session's own user.
    ///
    /// Connections from any other uid are dropped and the accept loop
    /// continues; the caller only ever sees authorized peers.
    ///
    /// # Errors
    ///
    /// Returns the underlying accept failure.
    pub async fn accept(&self) -> io::Result<UnixStream> {
        loop {
            let (stream, _addr) = self.listener.accept().await?;
            let creds = match PeerCredentials::from_stream(&stream) {
                Ok(creds) => creds,
                Err(err) => {
                    warn!("failed to read peer credentials: {err}");
                    continue;
                },
            };
            if !creds.uid_matches(self.owner_uid) {
                warn!(peer_uid = creds.uid, "rejecting connection from foreign uid");
                continue;
            }
            debug!(peer_uid = creds.uid, peer_pid = creds.pid, "accepted session connection");
            return Ok(stream);
        }
    }

    /// Path of the bound socket file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the socket file.
    pub fn cleanup(&self) {
        if self.path.exists() {
            if let Err(err) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), "failed to remove session socket: {err}");
            }
        }
    }
}

impl Drop for SessionSocket {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Create `path` as a 0700 directory if missing; refuse symlinks and
/// non-directories. Permissions of pre-existing directories are left
/// untouched.
fn ensure_directory(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.file_type().is_symlink() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} is a symlink, refusing to use as socket directory", path.display()),
                ));
            }
            if !metadata.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists but is not a directory", path.display()),
                ));
            }
            Ok(())
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            std::fs::create_dir_all(path)?;
            set_permissions(path, DIRECTORY_MODE)
        },
        Err(err) => Err(err),
    }
}

/// Remove a stale socket file, refusing to unlink anything that is not a
/// socket.
fn cleanup_socket(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) => {
            use std::os::unix::fs::FileTypeExt;
            if !metadata.file_type().is_socket() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists but is not a socket", path.display()),
                ));
            }
            std::fs::remove_file(path)?;
            debug!(path = %path.display(), "removed stale socket file");
            Ok(())
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn set_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn with_runtime_dir<T>(dir: &Path, f: impl FnOnce() -> T) -> T {
        // Serialize env mutation across tests in this module.
        static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(lio_core::config::RUNTIME_DIR_ENV, dir);
        let out = f();
        std::env::remove_var(lio_core::config::RUNTIME_DIR_ENV);
        out
    }

    #[tokio::test]
    async fn bind_sets_owner_only_permissions() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = with_runtime_dir(tmp.path(), || {
            SessionSocket::bind("perm-test", nix::unistd::getuid().as_raw()).unwrap()
        });
        let mode = std::fs::metadata(socket.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, SOCKET_MODE, "session socket should be 0600, got {mode:04o}");
    }

    #[tokio::test]
    async fn stale_socket_is_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        with_runtime_dir(tmp.path(), || {
            let first = SessionSocket::bind("stale-test", nix::unistd::getuid().as_raw()).unwrap();
            // Leave the socket file behind.
            std::mem::forget(first);
            let second = SessionSocket::bind("stale-test", nix::unistd::getuid().as_raw()).unwrap();
            assert!(second.path().exists());
        });
    }

    #[tokio::test]
    async fn non_socket_path_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        with_runtime_dir(tmp.path(), || {
            let path = session_socket_path("file-test");
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"not a socket").unwrap();
            let result = SessionSocket::bind("file-test", nix::unistd::getuid().as_raw());
            assert!(result.is_err());
        });
    }

    #[tokio::test]
    async fn accepts_connection_from_own_uid() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = with_runtime_dir(tmp.path(), || {
            SessionSocket::bind("accept-test", nix::unistd::getuid().as_raw()).unwrap()
        });
        let path = socket.path().to_path_buf();

        let accept = tokio::spawn(async move { socket.accept().await.unwrap() });
        let _client = UnixStream::connect(&path).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), accept)
            .await
            .expect("accept timed out")
            .unwrap();
    }
}
