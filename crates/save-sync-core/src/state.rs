//! Shared zoo state cache.
//!
//! Peers broadcast partial key→value diffs; each diff is shallow-merged into
//! one cache with last-writer-wins per key. There is no versioning and no
//! cross-peer conflict detection.

use crate::delegate::{PasswordProvider, SessionDelegate};
use crate::events::{EventBus, SessionEvent};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Flat key→value mapping.
pub type StateDiff = Map<String, Value>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("State diff must be a JSON object, got {0}")]
    NotAMapping(&'static str),
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Process-wide state cache plus the session password slot.
pub struct StateStore {
    cache: RwLock<StateDiff>,
    password: RwLock<Option<String>>,
    provider: Option<Box<dyn PasswordProvider>>,
    events: Arc<EventBus>,
}

impl StateStore {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            cache: RwLock::new(StateDiff::new()),
            password: RwLock::new(None),
            provider: None,
            events,
        }
    }

    /// Install the provider consulted the first time a password is needed.
    pub fn with_password_provider(mut self, provider: impl PasswordProvider + 'static) -> Self {
        self.provider = Some(Box::new(provider));
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Merge a diff into the cache and publish a snapshot.
    pub fn apply_state_diff(&self, diff: Value) -> Result<(), StateError> {
        let diff = match diff {
            Value::Object(diff) => diff,
            other => return Err(StateError::NotAMapping(json_kind(&other))),
        };

        let keys = diff.len();
        let snapshot = {
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            cache.extend(diff);
            cache.clone()
        };

        debug!("Applied state diff ({} key(s), {} cached)", keys, snapshot.len());
        self.events
            .emit(SessionEvent::StateUpdated { state: snapshot });
        Ok(())
    }

    /// Copy of the current cache.
    pub fn cached_state(&self) -> StateDiff {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Resolve the session password, asking the provider once.
    pub fn session_password(&self) -> Option<String> {
        if let Some(password) = self
            .password
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Some(password);
        }

        let resolved = self.provider.as_ref()?.session_password()?;
        *self.password.write().unwrap_or_else(|e| e.into_inner()) = Some(resolved.clone());
        Some(resolved)
    }

    pub fn set_session_password(&self, password: impl Into<String>) {
        *self.password.write().unwrap_or_else(|e| e.into_inner()) = Some(password.into());
        info!("Session password set");
    }

    /// Publish an incoming-save notification.
    pub fn notify_incoming_save(&self, path: &Path, sha256_hex: &str) {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(
            "Incoming save ready: {} (SHA-256 {}...)",
            filename,
            sha256_hex.get(..12).unwrap_or(sha256_hex)
        );

        self.events.emit(SessionEvent::IncomingSave {
            path: path.to_string_lossy().into_owned(),
            filename,
            sha256: sha256_hex.to_string(),
        });
    }
}

impl SessionDelegate for StateStore {
    fn session_password(&self) -> Option<String> {
        StateStore::session_password(self)
    }

    fn apply_state_diff(&self, diff: Value) {
        if let Err(e) = StateStore::apply_state_diff(self, diff) {
            warn!("Ignoring state diff: {}", e);
        }
    }

    fn notify_incoming_save(&self, path: &Path, sha256_hex: &str) {
        StateStore::notify_incoming_save(self, path, sha256_hex);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn store() -> StateStore {
        StateStore::new(Arc::new(EventBus::new()))
    }

    #[test]
    fn test_last_writer_wins_per_key() {
        let store = store();

        store.apply_state_diff(json!({"a": 1})).unwrap();
        store.apply_state_diff(json!({"b": 2})).unwrap();
        assert_eq!(Value::Object(store.cached_state()), json!({"a": 1, "b": 2}));

        store.apply_state_diff(json!({"a": 3})).unwrap();
        assert_eq!(Value::Object(store.cached_state()), json!({"a": 3, "b": 2}));
    }

    #[test]
    fn test_non_mapping_rejected_and_cache_untouched() {
        let store = store();
        store.apply_state_diff(json!({"a": 1})).unwrap();

        assert_eq!(
            store.apply_state_diff(json!([1, 2])),
            Err(StateError::NotAMapping("array"))
        );
        assert_eq!(
            store.apply_state_diff(json!("a")),
            Err(StateError::NotAMapping("string"))
        );
        assert_eq!(Value::Object(store.cached_state()), json!({"a": 1}));
    }

    #[test]
    fn test_cached_state_is_a_copy() {
        let store = store();
        store.apply_state_diff(json!({"a": 1})).unwrap();

        let mut copy = store.cached_state();
        copy.insert("b".into(), json!(2));

        assert_eq!(Value::Object(store.cached_state()), json!({"a": 1}));
    }

    #[test]
    fn test_subscribers_receive_snapshot() {
        let events = Arc::new(EventBus::new());
        let store = StateStore::new(Arc::clone(&events));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let _sub = events.subscribe(move |event| {
            if let SessionEvent::StateUpdated { state } = event {
                seen_clone.lock().unwrap().push(Value::Object(state));
            }
        });

        store.apply_state_diff(json!({"a": 1})).unwrap();
        store.apply_state_diff(json!({"b": 2})).unwrap();
        let _ = store.apply_state_diff(json!(null));

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![json!({"a": 1}), json!({"a": 1, "b": 2})]);
    }

    #[test]
    fn test_password_provider_consulted_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let store = store().with_password_provider(move || {
            calls_clone.fetch_add(1, Ordering::Relaxed);
            Some("zoo123".to_string())
        });

        assert_eq!(store.session_password().as_deref(), Some("zoo123"));
        assert_eq!(store.session_password().as_deref(), Some("zoo123"));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_no_provider_means_no_password() {
        assert_eq!(store().session_password(), None);
    }

    #[test]
    fn test_set_password_overrides_provider() {
        let store = store().with_password_provider(|| Some("from-provider".to_string()));
        store.set_session_password("explicit");
        assert_eq!(store.session_password().as_deref(), Some("explicit"));
    }

    #[test]
    fn test_incoming_save_event() {
        let events = Arc::new(EventBus::new());
        let store = StateStore::new(Arc::clone(&events));
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);
        let _sub = events.subscribe(move |event| {
            *seen_clone.lock().unwrap() = Some(event);
        });

        SessionDelegate::notify_incoming_save(&store, Path::new("/saves/ark.z2s"), "deadbeef");

        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(SessionEvent::IncomingSave {
                path: "/saves/ark.z2s".into(),
                filename: "ark.z2s".into(),
                sha256: "deadbeef".into(),
            })
        );
    }

    #[test]
    fn test_incoming_save_accepts_any_digest_text() {
        let store = store();
        // Multi-byte character straddling the log prefix boundary.
        store.notify_incoming_save(Path::new("/saves/ark.z2s"), "abcdefghijké");
        store.notify_incoming_save(Path::new("/saves/ark.z2s"), "ab");
    }
}
