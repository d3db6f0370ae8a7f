//! Save directory watcher with a settle delay.
//!
//! Uses notify-debouncer-mini: an event is delivered only after the file has
//! been quiet for the settle delay, so a save is never read half-written.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use save_sync_core::{EventBus, SessionEvent};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

type Debouncer = notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>;

/// Track last seen mtime to filter spurious events
type MtimeCache = Arc<Mutex<HashMap<PathBuf, SystemTime>>>;

/// Watches one directory (non-recursively) for modified save files.
pub struct SaveWatcher {
    dir: PathBuf,
    /// Debouncer handle (must keep alive)
    debouncer: Debouncer,
    /// Receiver for settled save paths
    event_rx: mpsc::UnboundedReceiver<PathBuf>,
}

impl SaveWatcher {
    /// Start watching `dir` for files ending in `.{extension}`.
    pub fn new(dir: PathBuf, extension: &str, settle_delay: Duration) -> Result<Self> {
        // Canonicalize so event paths share a prefix with the watched path.
        let dir = dir.canonicalize().unwrap_or(dir);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let dir_clone = dir.clone();
        let extension = extension.to_string();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));

        let mut debouncer = new_debouncer(
            settle_delay,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(path) =
                            Self::process_event(&event, &dir_clone, &extension, &mtime_cache)
                        {
                            if event_tx.send(path).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Save watcher error: {}", e);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&dir, RecursiveMode::NonRecursive)?;

        Ok(Self {
            dir,
            debouncer,
            event_rx,
        })
    }

    /// Return the save path for a relevant event.
    fn process_event(
        event: &DebouncedEvent,
        dir: &Path,
        extension: &str,
        mtime_cache: &MtimeCache,
    ) -> Option<PathBuf> {
        let path = &event.path;

        if path.parent() != Some(dir) {
            return None;
        }

        let matches_extension = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(extension));
        if !matches_extension {
            return None;
        }

        // Deleted or renamed away (e.g. moved to a backup)
        let Ok(metadata) = std::fs::metadata(path) else {
            mtime_cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(path);
            return None;
        };
        if !metadata.is_file() {
            return None;
        }

        if let Ok(mtime) = metadata.modified() {
            let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());
            if cache.get(path) == Some(&mtime) {
                // Mtime unchanged - spurious event, skip it
                return None;
            }
            cache.insert(path.clone(), mtime);
        }

        debug!("Save settled: {}", path.display());
        Some(path.clone())
    }

    /// Get the receiver for settled save paths.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<PathBuf> {
        &mut self.event_rx
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Hand each settled save to `on_save` on a background task.
    pub fn spawn<F, Fut>(self, on_save: F) -> RunningWatcher
    where
        F: Fn(PathBuf) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Self {
            dir,
            debouncer,
            mut event_rx,
        } = self;

        let task = tokio::spawn(async move {
            while let Some(path) = event_rx.recv().await {
                on_save(path).await;
            }
        });

        RunningWatcher {
            dir,
            _debouncer: debouncer,
            task,
        }
    }
}

/// A watcher whose events are being consumed. Stops when dropped.
pub struct RunningWatcher {
    dir: PathBuf,
    _debouncer: Debouncer,
    task: JoinHandle<()>,
}

impl RunningWatcher {
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for RunningWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Client-side watcher that asks the game to reload changed saves.
///
/// Restarted on the save directory of every incoming save.
pub struct ReloadWatcher {
    current: Mutex<Option<RunningWatcher>>,
    events: Arc<EventBus>,
    extension: String,
    settle_delay: Duration,
}

impl ReloadWatcher {
    pub fn new(events: Arc<EventBus>, extension: &str, settle_delay: Duration) -> Self {
        Self {
            current: Mutex::new(None),
            events,
            extension: extension.to_string(),
            settle_delay,
        }
    }

    /// Watch `dir` from now on, replacing any running watcher.
    pub fn restart(&self, dir: &Path) -> Result<()> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        // Drop the old watcher before starting the new one.
        *current = None;

        let events = Arc::clone(&self.events);
        let running = SaveWatcher::new(dir.to_path_buf(), &self.extension, self.settle_delay)?
            .spawn(move |path| {
                let events = Arc::clone(&events);
                async move {
                    info!("Save changed, requesting reload: {}", path.display());
                    events.emit(SessionEvent::SaveReloadRequested {
                        path: path.to_string_lossy().into_owned(),
                    });
                }
            });

        info!("Watching {} for incoming saves", running.dir().display());
        *current = Some(running);
        Ok(())
    }

    pub fn watched_dir(&self) -> Option<PathBuf> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|w| w.dir().to_path_buf())
    }

    pub fn stop(&self) {
        if self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
        {
            debug!("Reload watcher stopped");
        }
    }
}
