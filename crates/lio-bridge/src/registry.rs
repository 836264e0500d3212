//! The session directory: one live multiplexer session per session id.
//!
//! An explicit object with its own mutex, passed by reference to whatever
//! needs it — never package-level state. Starting a session closes and
//! replaces any prior entry under the same id; looking up a closed entry
//! removes it before reporting "no active session", so callers fail fast
//! instead of reusing a half-dead connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lio_core::mux::MuxSession;
use tracing::debug;

use crate::error::BridgeError;

/// What the orchestrator knows about one session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Session id, unique per live session.
    pub session_id: String,
    /// Username the session authenticated as.
    pub username: String,
    /// Elevated rights granted by the gateway.
    pub privileged: bool,
    /// When the handoff completed.
    pub created_at: DateTime<Utc>,
}

struct Entry {
    info: SessionInfo,
    session: Arc<MuxSession>,
}

/// Mutex-guarded map of live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl SessionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, closing and replacing any prior entry for the
    /// same id.
    ///
    /// The prior session's close happens outside the registry lock — its
    /// close callback re-enters this registry.
    pub fn insert(&self, info: SessionInfo, session: Arc<MuxSession>) {
        let session_id = info.session_id.clone();
        let prior = {
            let mut entries = self.entries.lock().expect("registry lock poisoned");
            entries.insert(session_id.clone(), Entry { info, session })
        };
        if let Some(prior) = prior {
            debug!(session_id = %session_id, "replacing existing session");
            prior.session.close();
        }
    }

    /// Look up a live session.
    ///
    /// A closed entry self-heals: it is removed here and reported as
    /// [`BridgeError::NoSession`], never handed back to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NoSession`] when the id is unknown or the
    /// entry turned out to be closed.
    pub fn get(&self, session_id: &str) -> Result<Arc<MuxSession>, BridgeError> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        match entries.get(session_id) {
            Some(entry) if entry.session.is_closed() => {
                entries.remove(session_id);
                Err(BridgeError::NoSession {
                    session_id: session_id.to_string(),
                })
            },
            Some(entry) => Ok(Arc::clone(&entry.session)),
            None => Err(BridgeError::NoSession {
                session_id: session_id.to_string(),
            }),
        }
    }

    /// Session metadata, if the entry exists (closed or not).
    #[must_use]
    pub fn info(&self, session_id: &str) -> Option<SessionInfo> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .get(session_id)
            .map(|entry| entry.info.clone())
    }

    /// Remove an entry if it still holds this exact session.
    ///
    /// Used by session close callbacks: a replaced session must not evict
    /// its successor under the same id.
    pub fn remove_session(&self, session_id: &str, session: &Arc<MuxSession>) {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        if let Some(entry) = entries.get(session_id) {
            if Arc::ptr_eq(&entry.session, session) {
                entries.remove(session_id);
            }
        }
    }

    /// Remove and close an entry outright (logout).
    pub fn remove(&self, session_id: &str) {
        let removed = {
            let mut entries = self.entries.lock().expect("registry lock poisoned");
            entries.remove(session_id)
        };
        if let Some(entry) = removed {
            entry.session.close();
        }
    }

    /// Close every session (orchestrator shutdown).
    pub fn close_all(&self) {
        let drained: Vec<Entry> = {
            let mut entries = self.entries.lock().expect("registry lock poisoned");
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.session.close();
        }
    }

    /// Metadata for every current entry.
    #[must_use]
    pub fn list(&self) -> Vec<SessionInfo> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Number of entries, closed stragglers included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("registry lock poisoned").len()
    }

    /// Whether the registry holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use lio_core::mux::MuxConfig;

    use super::*;

    fn info(id: &str) -> SessionInfo {
        SessionInfo {
            session_id: id.to_string(),
            username: "alice".to_string(),
            privileged: false,
            created_at: Utc::now(),
        }
    }

    /// A client session whose far end is kept alive by the returned half.
    fn session() -> (Arc<MuxSession>, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(4096);
        (Arc::new(MuxSession::client(near, MuxConfig::default())), far)
    }

    #[tokio::test]
    async fn duplicate_start_leaves_one_live_entry_and_closes_the_first() {
        let registry = SessionRegistry::new();
        let (first, _far1) = session();
        let (second, _far2) = session();

        registry.insert(info("s1"), Arc::clone(&first));
        registry.insert(info("s1"), Arc::clone(&second));

        assert_eq!(registry.len(), 1);
        assert!(first.is_closed());
        assert!(!second.is_closed());
        let live = registry.get("s1").unwrap();
        assert!(Arc::ptr_eq(&live, &second));
    }

    #[tokio::test]
    async fn closed_entry_self_heals_on_lookup() {
        let registry = SessionRegistry::new();
        let (sess, _far) = session();
        registry.insert(info("s1"), Arc::clone(&sess));

        sess.close();
        assert!(matches!(
            registry.get("s1"),
            Err(BridgeError::NoSession { .. })
        ));
        // The stale entry is gone; a second lookup fails the same way.
        assert_eq!(registry.len(), 0);
        assert!(matches!(
            registry.get("s1"),
            Err(BridgeError::NoSession { .. })
        ));
    }

    #[tokio::test]
    async fn close_callback_removal_does_not_evict_a_successor() {
        let registry = Arc::new(SessionRegistry::new());
        let (first, _far1) = session();
        let (second, _far2) = session();

        registry.insert(info("s1"), Arc::clone(&first));
        registry.insert(info("s1"), Arc::clone(&second));

        // A late close callback from the replaced session must not remove
        // the live successor.
        registry.remove_session("s1", &first);
        assert!(registry.get("s1").is_ok());

        registry.remove_session("s1", &second);
        assert!(registry.get("s1").is_err());
    }

    #[tokio::test]
    async fn unknown_id_reports_no_session() {
        let registry = SessionRegistry::new();
        match registry.get("missing") {
            Err(BridgeError::NoSession { session_id }) => assert_eq!(session_id, "missing"),
            Err(other) => panic!("expected NoSession, got {other}"),
            Ok(_) => panic!("expected NoSession, got a live session"),
        }
    }

    #[tokio::test]
    async fn close_all_drains_the_registry() {
        let registry = SessionRegistry::new();
        let (a, _far_a) = session();
        let (b, _far_b) = session();
        registry.insert(info("a"), Arc::clone(&a));
        registry.insert(info("b"), Arc::clone(&b));

        registry.close_all();
        assert!(registry.is_empty());
        assert!(a.is_closed());
        assert!(b.is_closed());
    }
}
