//! Inbound frame handling shared by hosts and clients.
//!
//! Frames from one peer are handled strictly in arrival order. A save that
//! fails verification or cannot be written is dropped; the connection stays
//! up. Only a decode error that desynchronizes the stream ends it.

use crate::save_store::{EchoGuard, SaveStore};
use crate::session::SessionContext;
use crate::watcher::ReloadWatcher;
use save_sync_core::protocol::SaveFrame;
use save_sync_core::{Frame, FrameError, FrameReader, SessionEvent, SessionKey};
use std::sync::Arc;
use tokio::io::AsyncBufRead;
use tracing::{debug, error, info, warn};

/// Why an inbound stream stopped.
#[derive(Debug)]
pub enum StreamEnd {
    /// The peer closed the connection between frames.
    Closed,
    /// A frame could not be decoded and the stream was abandoned.
    Failed(FrameError),
}

/// Applies frames received from one peer.
#[derive(Clone)]
pub struct Inbound {
    ctx: SessionContext,
    store: SaveStore,
    echo: Arc<EchoGuard>,
    reload: Option<Arc<ReloadWatcher>>,
}

impl Inbound {
    pub fn new(ctx: SessionContext, echo: Arc<EchoGuard>) -> Self {
        let store = SaveStore::new(ctx.config.inbox_dir.clone());
        Self {
            ctx,
            store,
            echo,
            reload: None,
        }
    }

    /// Watch the save directory of each applied save and request game reloads.
    pub fn with_reload_watcher(mut self, reload: Arc<ReloadWatcher>) -> Self {
        self.reload = Some(reload);
        self
    }

    /// Read and apply frames until the stream ends.
    pub async fn run<R>(
        &self,
        reader: &mut FrameReader<R>,
        key: Option<&SessionKey>,
        peer: &str,
    ) -> StreamEnd
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            match reader.read_frame().await {
                Ok(Some(frame)) => self.handle(frame, key, peer).await,
                Ok(None) => {
                    debug!("{} closed the connection", peer);
                    return StreamEnd::Closed;
                }
                Err(e) if e.is_recoverable() => {
                    warn!("Skipping frame from {}: {}", peer, e);
                }
                Err(e) => {
                    warn!("Dropping connection to {}: {}", peer, e);
                    return StreamEnd::Failed(e);
                }
            }
        }
    }

    pub async fn handle(&self, frame: Frame, key: Option<&SessionKey>, peer: &str) {
        match frame {
            Frame::Save(save) => self.on_save(save, key, peer).await,
            Frame::State(json) => self.on_state(&json, peer),
            Frame::Text(message) => self.on_text(message, peer),
            Frame::Hello(_) => warn!("Ignoring repeated HELLO from {}", peer),
        }
    }

    async fn on_save(&self, save: SaveFrame, key: Option<&SessionKey>, peer: &str) {
        if let Err(e) = save.verify(key) {
            warn!(
                target: "security",
                "Rejected save {} from {}: {}", save.filename, peer, e
            );
            return;
        }

        let save_dir = match self.ctx.config.resolve_save_dir() {
            Ok(dir) => dir,
            Err(e) => {
                error!("Cannot apply {} from {}: {}", save.filename, peer, e);
                return;
            }
        };

        // Recorded before the write lands so a local save watcher sees it as an echo.
        let sha256 = crate::save_store::sha256_hex(&save.payload);
        self.echo.record(&save.filename, &sha256);

        match self.store.apply(&save_dir, &save.filename, &save.payload).await {
            Ok(applied) => {
                info!(
                    "Received {} ({} bytes) from {}",
                    save.filename,
                    save.payload.len(),
                    peer
                );
                self.ctx
                    .delegate
                    .notify_incoming_save(&applied.path, &applied.sha256);
                if let Some(reload) = &self.reload {
                    if let Err(e) = reload.restart(&save_dir) {
                        warn!("Could not watch {}: {}", save_dir.display(), e);
                    }
                }
            }
            Err(e) => {
                self.echo.forget(&save.filename);
                error!("Failed to apply {} from {}: {}", save.filename, peer, e);
            }
        }
    }

    fn on_state(&self, json: &str, peer: &str) {
        match serde_json::from_str(json) {
            Ok(diff) => {
                debug!("State update from {}", peer);
                self.ctx.delegate.apply_state_diff(diff);
            }
            Err(e) => warn!("Invalid state JSON from {}: {}", peer, e),
        }
    }

    fn on_text(&self, message: String, peer: &str) {
        info!("Message from {}: {}", peer, message);
        self.ctx.events.emit(SessionEvent::TextReceived {
            from: peer.to_string(),
            message,
        });
    }
}
