//! Accept/dispatch loop.
//!
//! Every connection the worker serves — the handed-off one and any later
//! arrivals on the per-session socket — becomes a server-side multiplexer
//! session. Each accepted logical stream gets its own task: the initiator's
//! first frame names (group, command, args), and the dispatcher routes it
//! to a stream handler (which then owns the connection) or a JSON handler
//! (invoked once, answered with one result frame and a close).
//!
//! Unknown names are answered with a descriptive error result, never
//! dropped silently, and never crash the loop.

use std::sync::Arc;

use anyhow::Context as _;
use lio_core::config::SHUTDOWN_GRACE;
use lio_core::mux::{MuxConfig, MuxSession, MuxStream};
use lio_core::relay::{self, CallRequest, Opcode, ResultFrame};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::context::WorkerContext;
use crate::registry::{HandlerRegistry, StreamContext};
use crate::socket::{SessionSocket, take_handoff_socket};

/// Routes accepted streams to registered handlers.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    ctx: Arc<WorkerContext>,
    tracker: TaskTracker,
}

impl Dispatcher {
    /// Build a dispatcher over a frozen registry.
    #[must_use]
    pub fn new(registry: Arc<HandlerRegistry>, ctx: Arc<WorkerContext>) -> Self {
        Self {
            registry,
            ctx,
            tracker: TaskTracker::new(),
        }
    }

    /// Wrap a connection as a server session and serve it in the
    /// background. Returns the session so the caller can watch its close.
    pub fn serve_connection<T>(&self, conn: T) -> Arc<MuxSession>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session = Arc::new(MuxSession::server(conn, MuxConfig::default()));
        let this = self.clone();
        let serving = Arc::clone(&session);
        self.tracker.spawn(async move { this.serve_session(serving).await });
        session
    }

    /// Accept logical streams until the session closes or shutdown fires.
    async fn serve_session(self, session: Arc<MuxSession>) {
        loop {
            tokio::select! {
                () = self.ctx.shutdown.cancelled() => {
                    session.close();
                    break;
                },
                maybe = session.accept_stream() => match maybe {
                    Some(stream) => {
                        let this = self.clone();
                        self.tracker.spawn(async move { this.handle_stream(stream).await });
                    },
                    None => break,
                },
            }
        }
    }

    /// Dispatch one logical stream.
    pub async fn handle_stream(&self, mut stream: MuxStream) {
        let first = match relay::read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(err) => {
                debug!("stream ended before a call request arrived: {err}");
                return;
            },
        };
        let stream_id = first.stream_id;
        if first.opcode != Opcode::Data {
            let _ = relay::write_result_error(
                &mut stream,
                stream_id,
                400,
                "stream must open with a call request",
            )
            .await;
            return;
        }
        let request: CallRequest = match serde_json::from_slice(&first.payload) {
            Ok(request) => request,
            Err(err) => {
                let _ = relay::write_result_error(
                    &mut stream,
                    stream_id,
                    400,
                    format!("malformed call request: {err}"),
                )
                .await;
                return;
            },
        };

        // Stream types take the whole connection; a matching stream
        // handler owns it from here until it returns.
        if let Some(handler) = self.registry.stream_handler(&request.group) {
            let stream_ctx = StreamContext {
                worker: Arc::clone(&self.ctx),
                stream,
                stream_id,
                command: request.command.clone(),
                args: request.args,
                cancel: self.ctx.shutdown.child_token(),
            };
            debug!(group = %request.group, command = %request.command, "stream handler starting");
            if let Err(err) = handler.run(stream_ctx).await {
                warn!(group = %request.group, command = %request.command,
                      "stream handler failed: {err}");
            }
            return;
        }

        match self.registry.json_handler(&request.group, &request.command) {
            Some((handler, privileged_only)) => {
                if privileged_only && !self.ctx.privileged() {
                    let _ = relay::write_result_error(
                        &mut stream,
                        stream_id,
                        403,
                        format!(
                            "command {}/{} requires a privileged session",
                            request.group, request.command
                        ),
                    )
                    .await;
                    return;
                }
                match handler.call(&self.ctx, request.args).await {
                    Ok(data) => {
                        let _ = relay::write_result(&mut stream, stream_id, &ResultFrame::ok(data))
                            .await;
                    },
                    Err(err) => {
                        let _ = relay::write_result_error(
                            &mut stream,
                            stream_id,
                            err.code,
                            err.message,
                        )
                        .await;
                    },
                }
            },
            None => {
                let _ = relay::write_result_error(
                    &mut stream,
                    stream_id,
                    404,
                    format!("unknown command {}/{}", request.group, request.command),
                )
                .await;
            },
        }
    }

    /// Wait for in-flight handlers, bounded by the shutdown grace window.
    pub async fn drain(&self) {
        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("handlers still running after grace window, proceeding with teardown");
        }
    }
}

/// Run a fully assembled worker to completion.
///
/// Adopts the handed-off connection, binds the per-session socket, serves
/// until shutdown is requested (or the handed-off session dies), then
/// drains handlers and tears down session resources.
///
/// # Errors
///
/// Returns an error if the handed-off connection cannot be adopted or the
/// per-session socket cannot be bound; everything after that is handled
/// in-loop.
pub async fn run_worker(
    ctx: Arc<WorkerContext>,
    registry: Arc<HandlerRegistry>,
) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::new(registry, Arc::clone(&ctx));

    let handoff = take_handoff_socket().context("adopting handed-off connection")?;
    let handoff_session = dispatcher.serve_connection(handoff);
    {
        // Transport loss is a shutdown reason of its own; logout and
        // explicit shutdown arrive as control commands instead.
        let shutdown = ctx.shutdown.clone();
        handoff_session.set_on_close(move || {
            shutdown.request(crate::context::ShutdownReason::Other(
                "orchestrator connection lost".to_string(),
            ));
        });
    }

    let session_socket = SessionSocket::bind(&ctx.bootstrap.session_id, ctx.bootstrap.uid)
        .context("binding per-session socket")?;
    info!(
        session_id = %ctx.bootstrap.session_id,
        username = %ctx.bootstrap.username,
        privileged = ctx.bootstrap.privileged,
        "worker serving"
    );

    loop {
        tokio::select! {
            () = ctx.shutdown.cancelled() => break,
            accepted = session_socket.accept() => match accepted {
                Ok(conn) => {
                    dispatcher.serve_connection(conn);
                },
                Err(err) => {
                    warn!("session socket accept failed: {err}");
                },
            },
        }
    }

    dispatcher.drain().await;
    session_socket.cleanup();
    ctx.teardown();
    info!("worker exiting");
    Ok(())
}
