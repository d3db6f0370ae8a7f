//! Shared context and errors for hosts and clients.

use crate::config::{Config, ConfigError};
use save_sync_core::{EventBus, FrameError, Salt, SessionDelegate, SessionKey, StateStore};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("Failed to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("Session has been stopped")]
    Stopped,

    #[error("Session is not running")]
    NotRunning,

    #[error("Host requires a session password, but none was provided")]
    PasswordRequired,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Connection closed")]
    Disconnected,

    #[error("Failed to read save {path}: {source}")]
    ReadSave { path: PathBuf, source: io::Error },

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Save watcher error: {0}")]
    Watcher(String),
}

/// Everything a session borrows from its embedding application.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<Config>,
    pub delegate: Arc<dyn SessionDelegate>,
    pub events: Arc<EventBus>,
}

impl SessionContext {
    pub fn new(config: Config, delegate: Arc<dyn SessionDelegate>, events: Arc<EventBus>) -> Self {
        Self {
            config: Arc::new(config),
            delegate,
            events,
        }
    }

    /// Context backed by a `StateStore`, sharing its event bus.
    pub fn with_state_store(config: Config, store: Arc<StateStore>) -> Self {
        let events = Arc::clone(store.events());
        Self::new(config, store, events)
    }
}

/// Run PBKDF2 off the async workers.
pub(crate) async fn derive_key(password: String, salt: Salt) -> Result<SessionKey, SessionError> {
    tokio::task::spawn_blocking(move || SessionKey::derive(&password, &salt))
        .await
        .map_err(|e| SessionError::KeyDerivation(e.to_string()))
}

/// Filename component of a local save path.
pub(crate) fn save_filename(path: &std::path::Path) -> Result<String, SessionError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            SessionError::Frame(FrameError::InvalidFilename(path.display().to_string()))
        })
}
