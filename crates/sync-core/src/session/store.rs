//! Credential storage
//!
//! The store is the only owner of token state. The in-memory store backs tests
//! and short-lived tools; the file store keeps the session across restarts.

use crate::models::Session;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Errors from session persistence or refresh
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("session file is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The service refused the credentials or refresh token
    #[error("rejected by service: {0}")]
    Rejected(String),

    /// The sign-in or refresh call itself could not complete
    #[error("auth request failed: {0}")]
    Request(String),
}

/// Get/set/clear access to the current session
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self) -> Option<Session>;

    async fn set(&self, session: Session) -> Result<(), SessionError>;

    async fn clear(&self) -> Result<(), SessionError>;
}

/// Session held in memory only
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    session: RwLock<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            session: RwLock::new(Some(session)),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    async fn set(&self, session: Session) -> Result<(), SessionError> {
        *self.session.write().await = Some(session);
        Ok(())
    }

    async fn clear(&self) -> Result<(), SessionError> {
        *self.session.write().await = None;
        Ok(())
    }
}

/// Session persisted as a JSON file, cached in memory
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    cached: RwLock<Option<Session>>,
}

impl FileSessionStore {
    /// Open the store, loading an existing session file if there is one
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let path = path.into();
        let cached = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Session>(&bytes) {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable session file");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), has_session = cached.is_some(), "Session store opened");

        Ok(Self {
            path,
            cached: RwLock::new(cached),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_file(&self, session: &Session) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(session)?;
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &json).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get(&self) -> Option<Session> {
        self.cached.read().await.clone()
    }

    async fn set(&self, session: Session) -> Result<(), SessionError> {
        let mut cached = self.cached.write().await;
        self.write_file(&session).await?;
        *cached = Some(session);
        Ok(())
    }

    async fn clear(&self) -> Result<(), SessionError> {
        let mut cached = self.cached.write().await;
        *cached = None;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
