//! Registry of sessions the backend reports as active.
//!
//! Discovery aid only: it lets the operator find sessions started
//! elsewhere (another terminal, a previous run after logout) so they can
//! attach to them. The persisted attachment set — not this registry — is
//! the source of truth for which telemetry channels exist.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::api::{ApiClient, ApiError, StreamSession};
use crate::protocol::SessionId;

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Vec<StreamSession>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Replace the registry contents with a fresh active-session list.
    pub fn replace(&self, sessions: Vec<StreamSession>) {
        *self.inner.write() = sessions;
    }

    /// List all known active sessions.
    pub fn list(&self) -> Vec<StreamSession> {
        self.inner.read().clone()
    }

    /// Look up a session by id.
    pub fn get(&self, id: SessionId) -> Option<StreamSession> {
        self.inner.read().iter().find(|s| s.id == id).cloned()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.inner.read().iter().any(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Refresh from the backend's active list. Returns the session count.
    pub async fn refresh(&self, api: &ApiClient) -> Result<usize, ApiError> {
        let sessions = api.active_streams().await?;
        let count = sessions.len();
        self.replace(sessions);
        Ok(count)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
