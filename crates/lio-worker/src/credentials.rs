//! `SO_PEERCRED` peer validation for the per-session socket.
//!
//! The per-session socket is mode 0600 already; the credential check is
//! the second fence. Authorization is decided by kernel-reported peer
//! credentials, never by anything the client asserts.

use std::io;

use nix::sys::socket::getsockopt;
use nix::sys::socket::sockopt::PeerCredentials as PeerCredOpt;
use subtle::ConstantTimeEq;
use tokio::net::UnixStream;

/// Kernel-reported credentials of a connected Unix-socket peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Peer uid.
    pub uid: u32,
    /// Peer gid.
    pub gid: u32,
    /// Peer pid.
    pub pid: i32,
}

impl PeerCredentials {
    /// Extract credentials from a connected stream.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the `SO_PEERCRED` query fails.
    pub fn from_stream(stream: &UnixStream) -> io::Result<Self> {
        let creds = getsockopt(stream, PeerCredOpt)
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
        Ok(Self {
            uid: creds.uid(),
            gid: creds.gid(),
            pid: creds.pid(),
        })
    }

    /// Whether the peer's uid equals `expected_uid`, compared in constant
    /// time.
    #[must_use]
    pub fn uid_matches(&self, expected_uid: u32) -> bool {
        self.uid.to_ne_bytes().ct_eq(&expected_uid.to_ne_bytes()).unwrap_u8() == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn self_connection_reports_own_uid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cred.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let _client = UnixStream::connect(&path).await.unwrap();
        let server_side = accept.await.unwrap();

        let creds = PeerCredentials::from_stream(&server_side).unwrap();
        assert_eq!(creds.uid, nix::unistd::getuid().as_raw());
        assert_eq!(creds.gid, nix::unistd::getgid().as_raw());
        assert!(creds.uid_matches(nix::unistd::getuid().as_raw()));
        assert!(!creds.uid_matches(creds.uid.wrapping_add(1)));
    }
}
