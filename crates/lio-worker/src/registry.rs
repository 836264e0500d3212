//! Handler registry: (group, command) lookup with privilege gating.
//!
//! Built once during the worker's registration phase and frozen before the
//! first connection is accepted, so concurrent lookups need no locking.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lio_core::mux::MuxStream;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::context::WorkerContext;

/// Handler failure delivered to the caller as a non-ok result frame.
///
/// `code` carries HTTP-like semantics independent of transport status:
/// 400 bad arguments, 403 privilege refused, 404 unknown command, 500
/// handler failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    /// HTTP-like status code.
    pub code: u16,
    /// Message surfaced verbatim to the caller.
    pub message: String,
}

impl HandlerError {
    /// 400: arguments did not parse or validate.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            code: 400,
            message: message.into(),
        }
    }

    /// 403: command requires a privileged session.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            code: 403,
            message: message.into(),
        }
    }

    /// 404: no such group or command.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: 404,
            message: message.into(),
        }
    }

    /// 500: the handler itself failed.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: 500,
            message: message.into(),
        }
    }
}

/// One-shot JSON call handler.
///
/// Invoked synchronously by the dispatcher; the dispatcher marshals the
/// returned value into exactly one result frame followed by a close frame,
/// so a JSON handler never outlives its stream.
#[async_trait]
pub trait JsonHandler: Send + Sync {
    /// Execute the command.
    async fn call(&self, ctx: &WorkerContext, args: Value) -> Result<Value, HandlerError>;
}

/// Context handed to a stream handler along with ownership of its stream.
pub struct StreamContext {
    /// The worker this stream runs in.
    pub worker: Arc<WorkerContext>,
    /// The logical stream, owned by the handler for its entire lifetime.
    pub stream: MuxStream,
    /// Relay stream id named by the initiator's first frame.
    pub stream_id: u32,
    /// Command within the stream group (e.g. "send" vs "receive").
    pub command: String,
    /// Arguments from the opening frame.
    pub args: Value,
    /// Cancelled when the peer closes the stream or the worker shuts down.
    /// The handler must terminate any background work it started (killing
    /// a followed subprocess included) when this fires.
    pub cancel: CancellationToken,
}

/// Long-lived stream handler (terminal, logs, exec, file transfer).
///
/// Owns its connection for the stream's entire lifetime and is solely
/// responsible for emitting data/result/close frames and for detecting the
/// peer's close.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// Run the stream to completion.
    async fn run(&self, ctx: StreamContext) -> Result<(), HandlerError>;
}

struct JsonEntry {
    handler: Arc<dyn JsonHandler>,
    privileged_only: bool,
}

/// Immutable handler registry.
pub struct HandlerRegistry {
    json: HashMap<(String, String), JsonEntry>,
    streams: HashMap<String, Arc<dyn StreamHandler>>,
}

impl HandlerRegistry {
    /// Start the registration phase.
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            json: HashMap::new(),
            streams: HashMap::new(),
        }
    }

    /// O(1) JSON handler lookup.
    #[must_use]
    pub fn json_handler(&self, group: &str, command: &str) -> Option<(Arc<dyn JsonHandler>, bool)> {
        self.json
            .get(&(group.to_string(), command.to_string()))
            .map(|entry| (Arc::clone(&entry.handler), entry.privileged_only))
    }

    /// Stream handler lookup, keyed by stream-type string.
    #[must_use]
    pub fn stream_handler(&self, stream_type: &str) -> Option<Arc<dyn StreamHandler>> {
        self.streams.get(stream_type).cloned()
    }

    /// Registered (group, command) pairs, for the info handler.
    #[must_use]
    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .json
            .keys()
            .map(|(group, command)| format!("{group}/{command}"))
            .chain(self.streams.keys().map(|s| format!("{s}/*")))
            .collect();
        names.sort();
        names
    }
}

/// Mutable registry under construction.
///
/// The registration phase is the only writer; [`RegistryBuilder::build`]
/// freezes the tables for lock-free concurrent reads. Dynamically loaded
/// modules register here too, before the freeze.
pub struct RegistryBuilder {
    json: HashMap<(String, String), JsonEntry>,
    streams: HashMap<String, Arc<dyn StreamHandler>>,
}

impl RegistryBuilder {
    /// Register a JSON handler available to every session.
    #[must_use]
    pub fn register(
        mut self,
        group: impl Into<String>,
        command: impl Into<String>,
        handler: Arc<dyn JsonHandler>,
    ) -> Self {
        self.json.insert(
            (group.into(), command.into()),
            JsonEntry {
                handler,
                privileged_only: false,
            },
        );
        self
    }

    /// Register a JSON handler gated to privileged sessions.
    ///
    /// Unprivileged callers receive a 403 result frame; the handler itself
    /// is never invoked.
    #[must_use]
    pub fn register_privileged(
        mut self,
        group: impl Into<String>,
        command: impl Into<String>,
        handler: Arc<dyn JsonHandler>,
    ) -> Self {
        self.json.insert(
            (group.into(), command.into()),
            JsonEntry {
                handler,
                privileged_only: true,
            },
        );
        self
    }

    /// Register a stream handler under its stream-type string.
    #[must_use]
    pub fn register_stream(
        mut self,
        stream_type: impl Into<String>,
        handler: Arc<dyn StreamHandler>,
    ) -> Self {
        self.streams.insert(stream_type.into(), handler);
        self
    }

    /// Freeze the registry.
    #[must_use]
    pub fn build(self) -> Arc<HandlerRegistry> {
        Arc::new(HandlerRegistry {
            json: self.json,
            streams: self.streams,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl JsonHandler for Echo {
        async fn call(&self, _ctx: &WorkerContext, args: Value) -> Result<Value, HandlerError> {
            Ok(args)
        }
    }

    #[test]
    fn lookup_is_exact_match() {
        let registry = HandlerRegistry::builder()
            .register("control", "ping", Arc::new(Echo))
            .build();
        assert!(registry.json_handler("control", "ping").is_some());
        assert!(registry.json_handler("control", "pin").is_none());
        assert!(registry.json_handler("Control", "ping").is_none());
    }

    #[test]
    fn privileged_flag_is_preserved() {
        let registry = HandlerRegistry::builder()
            .register("a", "open", Arc::new(Echo))
            .register_privileged("a", "locked", Arc::new(Echo))
            .build();
        assert!(!registry.json_handler("a", "open").unwrap().1);
        assert!(registry.json_handler("a", "locked").unwrap().1);
    }

    #[test]
    fn command_names_are_sorted() {
        let registry = HandlerRegistry::builder()
            .register("b", "two", Arc::new(Echo))
            .register("a", "one", Arc::new(Echo))
            .build();
        assert_eq!(registry.command_names(), vec!["a/one", "b/two"]);
    }
}
