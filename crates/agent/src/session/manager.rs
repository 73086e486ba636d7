//! Session registry.
//!
//! Maps controller-assigned session IDs to live sessions. All operations are
//! safe to call concurrently from the control router, the inbound data path
//! and session teardown tasks.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::shell::{SessionError, SessionId, ShellSession};

/// Thread-safe registry of live sessions backed by DashMap.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<ShellSession>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Registers a session under its ID.
    ///
    /// Fails with `AlreadyExists` if the ID is taken; the existing session is
    /// left untouched.
    pub fn register(&self, session: Arc<ShellSession>) -> Result<(), SessionError> {
        match self.sessions.entry(session.id().clone()) {
            Entry::Occupied(entry) => Err(SessionError::AlreadyExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                debug!(session_id = %session.id(), "Registered session");
                entry.insert(session);
                Ok(())
            }
        }
    }

    /// Looks up a session by ID.
    pub fn lookup(&self, id: &str) -> Result<Arc<ShellSession>, SessionError> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Removes and closes the session with this ID.
    ///
    /// Unknown IDs are a no-op. Returns whether a session was removed.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self
            .sessions
            .remove_if(id, |_, session| {
                session.close();
                true
            })
            .is_some();

        if removed {
            info!(session_id = %id, "Removed session");
        }
        removed
    }

    /// Removes `session` only if it is still the one registered under its ID.
    ///
    /// Used by a session's own teardown so it never evicts a newer session
    /// that reused the ID.
    pub fn remove_session(&self, session: &Arc<ShellSession>) -> bool {
        let removed = self
            .sessions
            .remove_if(session.id().as_str(), |_, registered| {
                if Arc::ptr_eq(registered, session) {
                    registered.close();
                    true
                } else {
                    false
                }
            })
            .is_some();

        if removed {
            debug!(session_id = %session.id(), "Session deregistered itself");
        }
        removed
    }

    /// Whether a session is registered under this ID.
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// IDs of all registered sessions.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Removes and closes every session.
    pub fn close_all(&self) {
        let ids = self.ids();
        if !ids.is_empty() {
            info!(count = ids.len(), "Closing all sessions");
        }
        for id in ids {
            self.remove(&id);
        }
    }
}
