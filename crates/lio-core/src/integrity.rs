//! Worker binary integrity verification.
//!
//! The orchestrator refuses to start an auth handoff unless the worker
//! binary on disk hashes to the digest embedded at build time. This guards
//! the window between build and run: a substituted privileged binary fails
//! the check before anything ever dials the gateway.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Integrity check failures. All variants are fatal for session start.
#[derive(Debug, Error)]
pub enum IntegrityError {
    /// No expected digest was embedded at build time.
    ///
    /// Refusing here (instead of skipping the check) keeps an unverified
    /// build from ever launching the privileged side.
    #[error("no expected worker digest embedded in this build")]
    MissingExpectedDigest,

    /// The binary on disk does not hash to the embedded digest.
    #[error("worker binary digest mismatch: expected {expected}, actual {actual}")]
    Mismatch {
        /// Digest embedded at build time.
        expected: String,
        /// Digest computed from the file on disk.
        actual: String,
    },

    /// The binary could not be read.
    #[error("failed to read worker binary: {0}")]
    Io(#[from] std::io::Error),
}

/// Compute the lowercase hex SHA-256 digest of a file, streaming.
///
/// # Errors
///
/// Returns [`IntegrityError::Io`] if the file cannot be opened or read.
pub fn file_digest(path: &Path) -> Result<String, IntegrityError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Verify a worker binary against the expected digest.
///
/// `expected` is `None` when the build embedded no digest; that is itself
/// a refusal, not a pass.
///
/// # Errors
///
/// Returns [`IntegrityError::MissingExpectedDigest`], a [`IntegrityError::Mismatch`]
/// carrying both digests, or an I/O failure reading the binary.
pub fn verify_binary(path: &Path, expected: Option<&str>) -> Result<(), IntegrityError> {
    let expected = expected.ok_or(IntegrityError::MissingExpectedDigest)?;
    let actual = file_digest(path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(IntegrityError::Mismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn digest_matches_known_vector() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        // SHA-256("abc")
        assert_eq!(
            file_digest(file.path()).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn matching_digest_passes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"worker bytes").unwrap();
        let digest = file_digest(file.path()).unwrap();
        verify_binary(file.path(), Some(&digest)).unwrap();
        // Case-insensitive comparison.
        verify_binary(file.path(), Some(&digest.to_uppercase())).unwrap();
    }

    #[test]
    fn mismatch_reports_both_digests() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"worker bytes").unwrap();
        let expected = "00".repeat(32);
        match verify_binary(file.path(), Some(&expected)) {
            Err(IntegrityError::Mismatch { expected: e, actual }) => {
                assert_eq!(e, expected);
                assert_ne!(actual, expected);
            },
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn absent_embedded_digest_is_a_refusal() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            verify_binary(file.path(), None),
            Err(IntegrityError::MissingExpectedDigest)
        ));
    }
}
