//! Durable storage for the attached-session set.
//!
//! One JSON file holds the array of currently attached session ids. The
//! attachment manager is the only caller: it reads the set once at startup
//! and rewrites the whole set on every attach/detach. Individual channels
//! never touch the store.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::protocol::SessionId;

/// Errors from the attachment store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, #[source] std::io::Error),
}

/// Persistence port for the attached-session set.
pub trait AttachmentStore: Send + Sync {
    /// Load the persisted set. An absent backing file is the empty set.
    fn load(&self) -> Result<BTreeSet<SessionId>, StoreError>;
    /// Replace the persisted set with `ids`. Always a full rewrite.
    fn save(&self, ids: &BTreeSet<SessionId>) -> Result<(), StoreError>;
}

impl<T: AttachmentStore + ?Sized> AttachmentStore for std::sync::Arc<T> {
    fn load(&self) -> Result<BTreeSet<SessionId>, StoreError> {
        (**self).load()
    }

    fn save(&self, ids: &BTreeSet<SessionId>) -> Result<(), StoreError> {
        (**self).save(ids)
    }
}

/// File-backed store: a JSON array of session ids.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default location: `<state dir>/rtmpctl/attached.json`, falling back
    /// to the config dir on platforms without a state dir.
    pub fn default_path() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::config_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rtmpctl")
            .join("attached.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AttachmentStore for FileStore {
    fn load(&self) -> Result<BTreeSet<SessionId>, StoreError> {
        if !self.path.exists() {
            return Ok(BTreeSet::new());
        }
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| StoreError::ReadFailed(self.path.clone(), e))?;
        match serde_json::from_str::<BTreeSet<SessionId>>(&contents) {
            Ok(ids) => Ok(ids),
            Err(e) => {
                // A corrupt file must not brick startup: start from an empty
                // set and let the next attach rewrite it.
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "persisted attachment set is corrupt, starting empty"
                );
                Ok(BTreeSet::new())
            }
        }
    }

    fn save(&self, ids: &BTreeSet<SessionId>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::WriteFailed(self.path.clone(), e))?;
        }
        let contents = serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string());
        std::fs::write(&self.path, contents)
            .map_err(|e| StoreError::WriteFailed(self.path.clone(), e))
    }
}

/// In-memory store used by tests and by ephemeral invocations that should
/// not disturb the on-disk attachment set.
#[derive(Default)]
pub struct MemoryStore {
    inner: parking_lot::Mutex<BTreeSet<SessionId>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current contents, for assertions.
    pub fn snapshot(&self) -> BTreeSet<SessionId> {
        self.inner.lock().clone()
    }
}

impl AttachmentStore for MemoryStore {
    fn load(&self) -> Result<BTreeSet<SessionId>, StoreError> {
        Ok(self.inner.lock().clone())
    }

    fn save(&self, ids: &BTreeSet<SessionId>) -> Result<(), StoreError> {
        *self.inner.lock() = ids.clone();
        Ok(())
    }
}
