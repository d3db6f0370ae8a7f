//! Capabilities a session needs from its embedding application.
//!
//! A session is handed one `SessionDelegate` at construction and calls it from
//! its network tasks; it never looks collaborators up on its own.

use serde_json::Value;
use std::path::Path;

/// Supplies the shared session password when a signed session is joined.
pub trait PasswordProvider: Send + Sync {
    fn session_password(&self) -> Option<String>;
}

impl<F> PasswordProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn session_password(&self) -> Option<String> {
        self()
    }
}

/// Upward interface from a session to the application.
pub trait SessionDelegate: Send + Sync {
    /// Password for deriving the session key, if one is known.
    fn session_password(&self) -> Option<String>;

    /// Merge a received state diff. Non-mapping values must be ignored.
    fn apply_state_diff(&self, diff: Value);

    /// A save has been written to the game's save directory.
    fn notify_incoming_save(&self, path: &Path, sha256_hex: &str);
}
