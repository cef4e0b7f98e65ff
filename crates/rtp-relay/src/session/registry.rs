//! Connection id -> session table

use super::Session;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Shared handle to a registered session
///
/// The async mutex serializes every operation on one session; the registry
/// lock itself is never held across an `.await`.
pub type SessionHandle = Arc<tokio::sync::Mutex<Session>>;

/// Table of live sessions, at most one per connection id
pub struct SessionRegistry {
    /// Registered sessions
    sessions: RwLock<HashMap<String, SessionHandle>>,

    /// Maximum number of concurrent sessions (0 = unlimited)
    max_sessions: usize,
}

impl SessionRegistry {
    /// Create an empty registry
    ///
    /// # Arguments
    ///
    /// * `max_sessions` - Maximum number of concurrent sessions (0 = unlimited)
    pub fn new(max_sessions: usize) -> Self {
        info!("Creating session registry (max_sessions: {})", max_sessions);

        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Whether one more session fits
    pub fn has_capacity(&self) -> bool {
        self.max_sessions == 0 || self.sessions.read().len() < self.max_sessions
    }

    /// Register a session under its connection id
    ///
    /// # Errors
    ///
    /// `InvalidState` if the connection already has a session,
    /// `ResourceExhausted` if the table is full.
    pub fn register(&self, session: Session) -> Result<SessionHandle> {
        let id = session.id().to_string();
        let mut sessions = self.sessions.write();

        if sessions.contains_key(&id) {
            return Err(Error::InvalidState(format!(
                "connection {} already has a session",
                id
            )));
        }

        if self.max_sessions > 0 && sessions.len() >= self.max_sessions {
            return Err(Error::ResourceExhausted(format!(
                "maximum number of sessions reached ({})",
                self.max_sessions
            )));
        }

        let handle = Arc::new(tokio::sync::Mutex::new(session));
        sessions.insert(id.clone(), Arc::clone(&handle));
        debug!("Session registered for connection {}", id);

        Ok(handle)
    }

    /// Session bound to a connection, if any
    pub fn lookup(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.read().get(id).cloned()
    }

    /// Check if a connection has a session
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Unbind a connection's session
    ///
    /// Returns the handle if one was registered; removing twice is a no-op.
    pub fn remove(&self, id: &str) -> Option<SessionHandle> {
        let removed = self.sessions.write().remove(id);
        if removed.is_some() {
            debug!("Session removed for connection {}", id);
        }
        removed
    }

    /// Connection ids with a session
    pub fn ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Get session count
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// True when no session is registered
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
