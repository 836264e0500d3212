//! Per-process identity and shutdown signalling.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lio_core::Bootstrap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Why the worker is shutting down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// User logged out. The orchestrator performs the destructive parts of
    /// the cleanup itself, so session-scoped resources are left alone.
    Logout,
    /// Any other reason: full teardown of session-scoped resources.
    Other(String),
}

impl ShutdownReason {
    /// Parse the reason string carried by the shutdown command.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("logout") {
            Self::Logout
        } else {
            Self::Other(raw.to_string())
        }
    }
}

/// Single-shot shutdown signal shared across the worker.
///
/// The first `request` wins and records the reason; every long-lived task
/// holds a child token and unwinds when it fires.
#[derive(Clone)]
pub struct ShutdownSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl ShutdownSignal {
    /// Fresh, untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Trigger shutdown. The first caller's reason sticks.
    pub fn request(&self, reason: ShutdownReason) {
        {
            let mut slot = self.reason.lock().expect("shutdown lock poisoned");
            if slot.is_some() {
                return;
            }
            info!(?reason, "shutdown requested");
            *slot = Some(reason);
        }
        self.token.cancel();
    }

    /// The recorded reason, once requested.
    #[must_use]
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().expect("shutdown lock poisoned").clone()
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve when shutdown is requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Token for a task that must stop on shutdown but may also be
    /// cancelled independently (per-stream watchers).
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Cleanup hook for a session-scoped resource.
type Cleanup = Box<dyn FnOnce() + Send + 'static>;

/// Session-scoped resources needing teardown at exit.
///
/// Stream handlers register kill hooks for what they start (a user's PTY,
/// a helper process). Teardown runs them unless the shutdown reason is
/// logout, in which case destructive hooks are skipped because the
/// orchestrator redoes that cleanup itself.
#[derive(Default)]
pub struct SessionResources {
    cleanups: Mutex<Vec<(String, bool, Cleanup)>>,
}

impl SessionResources {
    /// Register a cleanup hook. `destructive` hooks are skipped on logout.
    pub fn register(&self, label: impl Into<String>, destructive: bool, cleanup: Cleanup) {
        self.cleanups
            .lock()
            .expect("resources lock poisoned")
            .push((label.into(), destructive, cleanup));
    }

    /// Run the registered hooks for the given shutdown reason.
    pub fn teardown(&self, reason: &ShutdownReason) {
        let hooks = std::mem::take(&mut *self.cleanups.lock().expect("resources lock poisoned"));
        for (label, destructive, cleanup) in hooks {
            if destructive && *reason == ShutdownReason::Logout {
                info!(resource = %label, "skipping teardown on logout");
                continue;
            }
            info!(resource = %label, "tearing down session resource");
            cleanup();
        }
    }
}

/// Everything a handler may need about the process it runs in.
pub struct WorkerContext {
    /// Identity and session context consumed from stdin at startup.
    pub bootstrap: Bootstrap,
    /// Worker-wide shutdown signal.
    pub shutdown: ShutdownSignal,
    /// Session-scoped resources torn down at exit.
    pub resources: SessionResources,
    /// Process start time.
    pub started_at: DateTime<Utc>,
}

impl WorkerContext {
    /// Build the context around a freshly consumed bootstrap record.
    #[must_use]
    pub fn new(bootstrap: Bootstrap) -> Arc<Self> {
        Arc::new(Self {
            bootstrap,
            shutdown: ShutdownSignal::new(),
            resources: SessionResources::default(),
            started_at: Utc::now(),
        })
    }

    /// Whether the session was granted elevated rights.
    #[must_use]
    pub fn privileged(&self) -> bool {
        self.bootstrap.privileged
    }

    /// Run teardown for the recorded shutdown reason.
    pub fn teardown(&self) {
        let reason = self
            .shutdown
            .reason()
            .unwrap_or_else(|| ShutdownReason::Other("transport lost".to_string()));
        if self.shutdown.reason().is_none() {
            warn!("teardown without explicit shutdown request");
        }
        self.resources.teardown(&reason);
    }
}
