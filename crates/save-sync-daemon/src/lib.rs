//! save-sync daemon library: sessions over TCP plus the filesystem side.
//!
//! The binary is a thin CLI over these modules; integration tests use them
//! directly.

pub mod client;
pub mod config;
pub mod connection;
pub mod connection_info;
pub mod dispatch;
pub mod host;
pub mod registry;
pub mod save_store;
pub mod session;
pub mod watcher;

// Re-export key types for convenience
pub use client::{join, ClientExit, ClientHandle, HandshakeStatus};
pub use config::{Config, ConfigError};
pub use connection_info::ConnectionInfo;
pub use host::SessionHost;
pub use registry::{BroadcastReport, PeerRegistry};
pub use save_store::{EchoGuard, SaveStore};
pub use session::{SessionContext, SessionError};
pub use watcher::{ReloadWatcher, SaveWatcher};
