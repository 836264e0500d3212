//! Built-in control handlers.
//!
//! The administrative handler groups (services, containers, disks, ...)
//! register through the same builder at startup; what lives here is the
//! minimum every worker carries regardless: liveness, identity, and the
//! shutdown command.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::context::{ShutdownReason, WorkerContext};
use crate::registry::{HandlerError, HandlerRegistry, JsonHandler, RegistryBuilder};
use crate::streams::{ExecStream, FileStream, LogsStream, TerminalStream};

/// "control"/"ping": liveness probe.
pub struct PingHandler;

#[async_trait]
impl JsonHandler for PingHandler {
    async fn call(&self, _ctx: &WorkerContext, _args: Value) -> Result<Value, HandlerError> {
        Ok(json!({ "pong": true }))
    }
}

/// "control"/"info": echo the session identity this worker runs as.
pub struct InfoHandler;

#[async_trait]
impl JsonHandler for InfoHandler {
    async fn call(&self, ctx: &WorkerContext, _args: Value) -> Result<Value, HandlerError> {
        Ok(json!({
            "session_id": ctx.bootstrap.session_id,
            "username": ctx.bootstrap.username,
            "uid": ctx.bootstrap.uid,
            "gid": ctx.bootstrap.gid,
            "privileged": ctx.bootstrap.privileged,
            "started_at": ctx.started_at.to_rfc3339(),
        }))
    }
}

#[derive(Deserialize)]
struct ShutdownArgs {
    #[serde(default)]
    reason: String,
}

/// "control"/"shutdown": request worker shutdown.
///
/// The acknowledgement must reach the caller before the accept loop tears
/// the session down, so the signal fires shortly after this handler
/// returns rather than within it.
pub struct ShutdownHandler;

/// Delay between acknowledging the shutdown command and firing the signal.
const SHUTDOWN_ACK_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

#[async_trait]
impl JsonHandler for ShutdownHandler {
    async fn call(&self, ctx: &WorkerContext, args: Value) -> Result<Value, HandlerError> {
        let args: ShutdownArgs = serde_json::from_value(args)
            .map_err(|err| HandlerError::bad_request(format!("bad shutdown arguments: {err}")))?;
        let reason = if args.reason.is_empty() {
            ShutdownReason::Other("shutdown command".to_string())
        } else {
            ShutdownReason::parse(&args.reason)
        };
        let shutdown = ctx.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SHUTDOWN_ACK_DELAY).await;
            shutdown.request(reason);
        });
        Ok(json!({ "shutting_down": true }))
    }
}

/// Register the built-in handlers on a builder.
#[must_use]
pub fn register_builtin(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .register("control", "ping", Arc::new(PingHandler))
        .register("control", "info", Arc::new(InfoHandler))
        .register("control", "shutdown", Arc::new(ShutdownHandler))
        .register_stream("terminal", Arc::new(TerminalStream))
        .register_stream("logs", Arc::new(LogsStream::default()))
        .register_stream("exec", Arc::new(ExecStream))
        .register_stream("file", Arc::new(FileStream))
}

/// The registry a stock worker starts with.
#[must_use]
pub fn default_registry() -> Arc<HandlerRegistry> {
    register_builtin(HandlerRegistry::builder()).build()
}
