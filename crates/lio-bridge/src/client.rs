//! The bridge client: three call shapes over one session.
//!
//! - **Typed call**: one request, exactly one result frame, decoded into a
//!   caller-supplied type.
//! - **Progress call**: the same, with interleaved progress ticks
//!   forwarded to a sink while the loop keeps waiting for the result; a
//!   caller-supplied cancellation closes the stream early and is reported
//!   as [`BridgeError::Cancelled`], distinct from a transport failure.
//! - **Raw stream**: the opened stream handed straight back for terminal
//!   I/O, file transfer, and process execution.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use lio_core::config;
use lio_core::mux::{MuxConfig, MuxSession, MuxStream};
use lio_core::relay::{self, CallRequest, Opcode, ProgressTick, RelayFrame, ResultFrame};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::handoff::{AuthOptions, EMBEDDED_WORKER_DIGEST, start_handoff};
use crate::progress::ProgressSink;
use crate::registry::{SessionInfo, SessionRegistry};

/// Bridge client configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Control socket the gateway listens on.
    pub control_socket: PathBuf,
    /// Installed path of the worker binary.
    pub worker_path: PathBuf,
    /// Expected worker digest; defaults to the build-time embedded value.
    pub expected_worker_digest: Option<String>,
    /// Multiplexer tuning for new sessions.
    pub mux: MuxConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            control_socket: config::control_socket_path(),
            worker_path: PathBuf::from("/usr/libexec/lio-worker"),
            expected_worker_digest: EMBEDDED_WORKER_DIGEST.map(str::to_string),
            mux: MuxConfig::default(),
        }
    }
}

/// Orchestrator-side bridge client.
///
/// Owns the session directory; everything that needs a session goes
/// through here by id.
pub struct Bridge {
    config: BridgeConfig,
    registry: Arc<SessionRegistry>,
}

impl Bridge {
    /// Bridge with its own empty session directory.
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
        }
    }

    /// The session directory.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Authenticate and start a session.
    ///
    /// Verifies the worker binary, runs the auth handoff, wraps the
    /// handed-off connection as a client multiplexer session, and records
    /// it in the directory — closing and replacing any prior session under
    /// the same id. The session removes itself from the directory when it
    /// closes.
    ///
    /// # Errors
    ///
    /// Everything from [`start_handoff`].
    pub async fn start_session(&self, mut options: AuthOptions) -> Result<SessionInfo, BridgeError> {
        if options.session_id.is_empty() {
            options.session_id = uuid::Uuid::new_v4().to_string();
        }
        let handoff = start_handoff(
            &self.config.control_socket,
            &options,
            self.config.expected_worker_digest.as_deref(),
        )
        .await?;

        let info = SessionInfo {
            session_id: options.session_id.clone(),
            username: options.user.clone(),
            privileged: handoff.response.mode.is_privileged(),
            created_at: Utc::now(),
        };

        let session = Arc::new(MuxSession::client(handoff.conn, self.config.mux.clone()));
        self.registry.insert(info.clone(), Arc::clone(&session));
        {
            let registry = Arc::clone(&self.registry);
            let session_for_callback = Arc::clone(&session);
            let session_id = info.session_id.clone();
            session.set_on_close(move || {
                registry.remove_session(&session_id, &session_for_callback);
            });
        }

        debug!(session_id = %info.session_id, privileged = info.privileged, "session started");
        Ok(info)
    }

    /// Open a stream on a session and send the opening call request.
    async fn open_call(
        &self,
        session_id: &str,
        group: &str,
        command: &str,
        args: serde_json::Value,
    ) -> Result<MuxStream, BridgeError> {
        let session = self.registry.get(session_id)?;
        let mut stream = session.open_stream()?;
        let relay_stream_id = stream.id();
        let request = CallRequest::new(group, command, args);
        let payload = serde_json::to_vec(&request)?;
        tokio::time::timeout(
            config::CALL_WRITE_TIMEOUT,
            relay::write_frame(&mut stream, &RelayFrame::data(relay_stream_id, payload)),
        )
        .await
        .map_err(|_| lio_core::ProtocolError::Timeout {
            phase: "call request write",
            duration_ms: config::CALL_WRITE_TIMEOUT.as_millis() as u64,
        })??;
        Ok(stream)
    }

    /// Typed one-shot call.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Handler`] if the result status is not ok;
    /// [`BridgeError::EmptyResult`] if the payload is empty although a
    /// destination was requested; transport and decode errors otherwise.
    pub async fn call<T: DeserializeOwned>(
        &self,
        session_id: &str,
        group: &str,
        command: &str,
        args: serde_json::Value,
    ) -> Result<T, BridgeError> {
        let mut stream = self.open_call(session_id, group, command, args).await?;
        let result = read_result(&mut stream, None).await?;
        decode_result(result)
    }

    /// One-shot call whose result payload is ignored.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Handler`] if the result status is not ok; transport
    /// errors otherwise.
    pub async fn call_ignored(
        &self,
        session_id: &str,
        group: &str,
        command: &str,
        args: serde_json::Value,
    ) -> Result<(), BridgeError> {
        let mut stream = self.open_call(session_id, group, command, args).await?;
        let result = read_result(&mut stream, None).await?;
        if result.is_ok() {
            Ok(())
        } else {
            Err(BridgeError::Handler {
                code: result.code,
                message: result.status,
            })
        }
    }

    /// Progress-reporting call.
    ///
    /// Interleaved data frames decode as [`ProgressTick`]s and go to
    /// `sink` under `key` while the loop waits for the terminating result.
    /// Cancelling `cancel` closes the stream early and returns
    /// [`BridgeError::Cancelled`].
    ///
    /// # Errors
    ///
    /// As [`Bridge::call`], plus [`BridgeError::Cancelled`].
    pub async fn call_with_progress<T: DeserializeOwned>(
        &self,
        session_id: &str,
        group: &str,
        command: &str,
        args: serde_json::Value,
        key: &str,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<T, BridgeError> {
        let mut stream = self.open_call(session_id, group, command, args).await?;
        let relay_stream_id = stream.id();
        let result = tokio::select! {
            () = cancel.cancelled() => {
                let _ = relay::write_close(&mut stream, relay_stream_id).await;
                return Err(BridgeError::Cancelled);
            },
            result = read_result(&mut stream, Some((key, sink.as_ref()))) => result?,
        };
        decode_result(result)
    }

    /// Raw interactive stream.
    ///
    /// The opening call request is sent; everything after that is the
    /// caller's, uninterpreted beyond the relay envelope.
    ///
    /// # Errors
    ///
    /// Session lookup, stream open, and write failures.
    pub async fn open_stream(
        &self,
        session_id: &str,
        group: &str,
        command: &str,
        args: serde_json::Value,
    ) -> Result<MuxStream, BridgeError> {
        self.open_call(session_id, group, command, args).await
    }

    /// Ask the worker to shut down, then close and drop the session.
    ///
    /// Shutdown errors are warnings: the session is removed either way,
    /// and a worker that failed to acknowledge is left to its own
    /// transport-loss handling.
    pub async fn shutdown_session(&self, session_id: &str, reason: &str) {
        match self
            .call_ignored(
                session_id,
                "control",
                "shutdown",
                serde_json::json!({ "reason": reason }),
            )
            .await
        {
            Ok(()) => {},
            Err(err) => warn!(session_id = %session_id, "session shutdown call failed: {err}"),
        }
        self.registry.remove(session_id);
    }
}

/// Read frames until the result frame, forwarding progress ticks if a
/// sink was supplied.
async fn read_result(
    stream: &mut MuxStream,
    progress: Option<(&str, &dyn ProgressSink)>,
) -> Result<ResultFrame, BridgeError> {
    loop {
        let frame = relay::read_frame(stream).await?;
        match frame.opcode {
            Opcode::Result => {
                let result: ResultFrame = serde_json::from_slice(&frame.payload)?;
                return Ok(result);
            },
            Opcode::Data => {
                if let Some((key, sink)) = progress {
                    match serde_json::from_slice::<ProgressTick>(&frame.payload) {
                        Ok(tick) => sink.progress(key, tick),
                        Err(err) => warn!("discarding malformed progress tick: {err}"),
                    }
                }
                // Plain calls ignore interleaved data frames.
            },
            Opcode::Close => return Err(BridgeError::ClosedBeforeResult),
        }
    }
}

fn decode_result<T: DeserializeOwned>(result: ResultFrame) -> Result<T, BridgeError> {
    if !result.is_ok() {
        return Err(BridgeError::Handler {
            code: result.code,
            message: result.status,
        });
    }
    if result.data.is_null() {
        return Err(BridgeError::EmptyResult);
    }
    serde_json::from_value(result.data).map_err(BridgeError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_empty_payload_when_destination_requested() {
        let result = ResultFrame::ok(serde_json::Value::Null);
        let outcome: Result<serde_json::Value, _> = decode_result(result);
        assert!(matches!(outcome, Err(BridgeError::EmptyResult)));
    }

    #[test]
    fn decode_surfaces_handler_errors() {
        let result = ResultFrame::error(404, "unknown command x/y");
        let outcome: Result<serde_json::Value, _> = decode_result(result);
        match outcome {
            Err(BridgeError::Handler { code, message }) => {
                assert_eq!(code, 404);
                assert!(message.contains("unknown"));
            },
            _ => panic!("expected handler error"),
        }
    }

    #[test]
    fn decode_returns_typed_payload() {
        #[derive(serde::Deserialize)]
        struct Pong {
            pong: bool,
        }
        let result = ResultFrame::ok(serde_json::json!({"pong": true}));
        let pong: Pong = decode_result(result).unwrap();
        assert!(pong.pong);
    }
}
