//! Bridge error taxonomy.
//!
//! Callers branch on the class, not the message: a handler-reported
//! failure is shown to the user as the command's outcome, a transport
//! failure retires the session, an auth rejection surfaces its reason
//! verbatim, and an integrity failure stops everything before a single
//! byte is dialed.

use lio_core::ProtocolError;
use lio_core::integrity::IntegrityError;
use lio_core::mux::MuxError;
use thiserror::Error;

/// Errors surfaced by the bridge client.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The worker binary failed its digest check; nothing was dialed.
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    /// Wire-level failure: transport I/O, timeouts, or a peer speaking a
    /// corrupt protocol. Distinguish with
    /// [`ProtocolError::is_protocol_violation`].
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The gateway rejected the credentials. The reason is surfaced
    /// verbatim; the connection is closed and not retried.
    #[error("authentication failed: {reason}")]
    Auth {
        /// Error string embedded in the auth response.
        reason: String,
    },

    /// Multiplexer failure on an established session.
    #[error(transparent)]
    Mux(#[from] MuxError),

    /// No live session under this id.
    #[error("no active session {session_id}")]
    NoSession {
        /// The id that was looked up.
        session_id: String,
    },

    /// The handler reported a failure. Distinct from transport errors:
    /// the stream completed normally.
    #[error("handler error ({code}): {message}")]
    Handler {
        /// HTTP-like status code from the result frame.
        code: u16,
        /// Handler message, surfaced verbatim.
        message: String,
    },

    /// The call succeeded but carried no payload to decode into the
    /// requested destination.
    #[error("handler returned an empty result")]
    EmptyResult,

    /// The result payload did not decode into the requested type.
    #[error("failed to decode result payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// The caller's cancellation signal closed the call early. Distinct
    /// from a transport error: the session is still healthy.
    #[error("call cancelled by caller")]
    Cancelled,

    /// The stream closed before a result frame arrived.
    #[error("stream closed before a result arrived")]
    ClosedBeforeResult,
}
