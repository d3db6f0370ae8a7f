//! Registry of connected peers.
//!
//! One mutex guards the peer list. Broadcasts snapshot the list under the
//! lock, release it, write to each peer outside the lock, and re-acquire it
//! only to prune a peer whose send failed.

use crate::connection::PeerConnection;
use save_sync_core::{EventBus, SessionEvent};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Thread-safe set of active peer connections.
pub struct PeerRegistry {
    peers: Mutex<Vec<Arc<PeerConnection>>>,
    events: Arc<EventBus>,
}

impl PeerRegistry {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            peers: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Register a peer. Returns false if a peer with the same id is already present.
    pub fn add(&self, peer: Arc<PeerConnection>) -> bool {
        {
            let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
            if peers.iter().any(|p| p.id() == peer.id()) {
                return false;
            }
            peers.push(peer);
        }
        self.notify_changed();
        true
    }

    /// Remove a peer by id.
    pub fn remove(&self, id: u64) -> Option<Arc<PeerConnection>> {
        let removed = {
            let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
            let index = peers.iter().position(|p| p.id() == id)?;
            peers.swap_remove(index)
        };
        self.notify_changed();
        Some(removed)
    }

    /// Remove every peer, returning them for teardown.
    pub fn drain(&self) -> Vec<Arc<PeerConnection>> {
        let drained: Vec<_> = {
            let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
            peers.drain(..).collect()
        };
        if !drained.is_empty() {
            self.notify_changed();
        }
        drained
    }

    pub fn snapshot(&self) -> Vec<Arc<PeerConnection>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remote addresses of all registered peers.
    pub fn addresses(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|p| p.addr().to_string())
            .collect()
    }

    /// Send one encoded frame to every peer, pruning peers whose send fails.
    pub async fn broadcast(&self, frame: &[u8], what: &str) -> BroadcastReport {
        let targets = self.snapshot();
        let mut report = BroadcastReport::default();

        for peer in targets {
            match peer.send(frame).await {
                Ok(()) => {
                    report.delivered += 1;
                    debug!("Sent {} to {}", what, peer.addr());
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("Failed to send {} to {}: {}", what, peer.addr(), e);
                    if self.remove(peer.id()).is_some() {
                        info!("Dropped peer {} after send failure", peer.addr());
                    }
                    peer.close().await;
                }
            }
        }

        report
    }

    fn notify_changed(&self) {
        let peers = self.addresses();
        debug!("Peer list changed: {:?}", peers);
        self.events.emit(SessionEvent::PeersChanged { peers });
    }
}
