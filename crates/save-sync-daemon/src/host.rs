//! Session host: accepts peers and broadcasts saves, state and text.
//!
//! The host binds one TCP listener. Every accepted socket is sent the session
//! `Hello` before it is registered, then gets its own handler task that
//! applies the frames it sends. Broadcasts go to every registered peer; a
//! peer whose send fails is pruned and the broadcast carries on.

use crate::connection::PeerConnection;
use crate::connection_info::{self, ConnectionInfo};
use crate::dispatch::{Inbound, StreamEnd};
use crate::registry::{BroadcastReport, PeerRegistry};
use crate::save_store::{sha256_hex, EchoGuard};
use crate::session::{derive_key, save_filename, SessionContext, SessionError};
use crate::watcher::{RunningWatcher, SaveWatcher};
use save_sync_core::protocol::SaveFrame;
use save_sync_core::{Frame, FrameReader, Hello, Salt, SessionKey, StateDiff};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

enum HostState {
    Init,
    Listening(Listening),
    Stopped,
}

struct Listening {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    key: Option<SessionKey>,
}

struct HostInner {
    ctx: SessionContext,
    state: Mutex<HostState>,
    registry: PeerRegistry,
    echo: Arc<EchoGuard>,
    watcher: Mutex<Option<RunningWatcher>>,
    next_peer_id: AtomicU64,
}

/// Listening side of a session.
#[derive(Clone)]
pub struct SessionHost {
    inner: Arc<HostInner>,
}

impl SessionHost {
    pub fn new(ctx: SessionContext) -> Self {
        let registry = PeerRegistry::new(Arc::clone(&ctx.events));
        Self {
            inner: Arc::new(HostInner {
                ctx,
                state: Mutex::new(HostState::Init),
                registry,
                echo: Arc::new(EchoGuard::new()),
                watcher: Mutex::new(None),
                next_peer_id: AtomicU64::new(1),
            }),
        }
    }

    /// Start listening. Saves are signed when a non-empty password is given.
    ///
    /// Returns the bound address. Calling this again while listening returns
    /// the same address; calling it after `stop` fails.
    pub async fn start(&self, password: Option<&str>) -> Result<SocketAddr, SessionError> {
        match &*self.inner.lock_state() {
            HostState::Listening(listening) => return Ok(listening.local_addr),
            HostState::Stopped => return Err(SessionError::Stopped),
            HostState::Init => {}
        }

        let (hello, key) = match password.filter(|p| !p.is_empty()) {
            Some(password) => {
                let salt = Salt::random();
                let key = derive_key(password.to_string(), salt).await?;
                (Hello::signed(salt), Some(key))
            }
            None => (Hello::unsigned(), None),
        };

        let config = &self.inner.ctx.config;
        let addr = SocketAddr::new(config.bind_host, config.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| SessionError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let mut state = self.inner.lock_state();
        match &*state {
            HostState::Listening(listening) => return Ok(listening.local_addr),
            HostState::Stopped => return Err(SessionError::Stopped),
            HostState::Init => {}
        }

        let accept_task = tokio::spawn(accept_loop(
            Arc::downgrade(&self.inner),
            listener,
            hello.encode(),
            key.clone(),
        ));
        *state = HostState::Listening(Listening {
            local_addr,
            accept_task,
            key,
        });

        info!(
            "Hosting on {} (signing {})",
            local_addr,
            if hello.signing_enabled() { "on" } else { "off" }
        );
        Ok(local_addr)
    }

    /// Stop listening, disconnect every peer and stop the save watcher.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.inner.lock_state(), HostState::Stopped);
        let HostState::Listening(listening) = previous else {
            return;
        };

        listening.accept_task.abort();
        let _ = listening.accept_task.await;

        for peer in self.inner.registry.drain() {
            peer.close().await;
        }
        self.stop_save_watcher();

        info!("Host on {} stopped", listening.local_addr);
    }

    /// Broadcast a save file to every peer.
    pub async fn push_save(&self, path: impl AsRef<Path>) -> Result<BroadcastReport, SessionError> {
        let path = path.as_ref();
        let key = self.inner.session_key()?;
        let filename = save_filename(path)?;
        let payload = tokio::fs::read(path)
            .await
            .map_err(|source| SessionError::ReadSave {
                path: path.to_path_buf(),
                source,
            })?;
        self.inner.broadcast_save(filename, payload, key.as_ref()).await
    }

    /// Broadcast a state diff to every peer.
    pub async fn push_state_update(
        &self,
        diff: &StateDiff,
    ) -> Result<BroadcastReport, SessionError> {
        self.inner.session_key()?;
        let frame = Frame::state(diff).encode()?;
        Ok(self.inner.broadcast(&frame, "state update").await)
    }

    /// Broadcast a text message to every peer.
    pub async fn push_text(&self, message: &str) -> Result<BroadcastReport, SessionError> {
        self.inner.session_key()?;
        let frame = Frame::Text(message.to_string()).encode()?;
        Ok(self.inner.broadcast(&frame, "text").await)
    }

    /// Watch the save directory and push every settled save change.
    ///
    /// Replaces a running save watcher. Returns the watched directory.
    pub fn start_save_watcher(&self) -> Result<PathBuf, SessionError> {
        self.inner.session_key()?;
        let config = &self.inner.ctx.config;
        let dir = config.resolve_save_dir()?;

        let mut slot = self.inner.watcher.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;

        let weak = Arc::downgrade(&self.inner);
        let running = SaveWatcher::new(
            dir,
            &config.save_extension,
            config.effective_settle_delay(),
        )
        .map_err(|e| SessionError::Watcher(e.to_string()))?
        .spawn(move |path| {
            let weak = Weak::clone(&weak);
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.on_save_changed(&path).await;
                }
            }
        });

        let dir = running.dir().to_path_buf();
        info!("Watching {} for save changes", dir.display());
        *slot = Some(running);
        Ok(dir)
    }

    pub fn stop_save_watcher(&self) {
        if self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
        {
            debug!("Save watcher stopped");
        }
    }

    /// Local and public addresses peers can use to reach this host.
    pub async fn connection_info(&self) -> ConnectionInfo {
        let config = &self.inner.ctx.config;
        let port = self.local_addr().map_or(config.port, |a| a.port());
        connection_info::lookup(&config.route_addr, &config.ip_echo_url, port).await
    }

    /// Resolve connection info in the background and hand it to `callback`.
    pub fn connection_info_with<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(ConnectionInfo) + Send + 'static,
    {
        let config = &self.inner.ctx.config;
        let port = self.local_addr().map_or(config.port, |a| a.port());
        connection_info::lookup_with(
            config.route_addr.clone(),
            config.ip_echo_url.clone(),
            port,
            callback,
        )
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.inner.lock_state() {
            HostState::Listening(listening) => Some(listening.local_addr),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.local_addr().is_some()
    }

    pub fn signing_enabled(&self) -> bool {
        matches!(
            &*self.inner.lock_state(),
            HostState::Listening(Listening { key: Some(_), .. })
        )
    }

    /// Remote addresses of connected peers.
    pub fn peers(&self) -> Vec<String> {
        self.inner.registry.addresses()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.registry.len()
    }
}

impl HostInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Session key of a listening host (`None` for an unsigned session).
    fn session_key(&self) -> Result<Option<SessionKey>, SessionError> {
        match &*self.lock_state() {
            HostState::Listening(listening) => Ok(listening.key.clone()),
            HostState::Init => Err(SessionError::NotRunning),
            HostState::Stopped => Err(SessionError::Stopped),
        }
    }

    async fn broadcast(&self, frame: &[u8], what: &str) -> BroadcastReport {
        if self.registry.is_empty() {
            info!("No peers connected, {} not sent", what);
            return BroadcastReport::default();
        }
        self.registry.broadcast(frame, what).await
    }

    async fn broadcast_save(
        &self,
        filename: String,
        payload: Vec<u8>,
        key: Option<&SessionKey>,
    ) -> Result<BroadcastReport, SessionError> {
        let size = payload.len();
        let frame = SaveFrame::new(filename, payload, key)?;
        let what = format!("save {}", frame.filename);
        let report = self.broadcast(&frame.encode()?, &what).await;
        if report.delivered > 0 {
            info!(
                "Pushed {} ({} bytes) to {} peer(s)",
                frame.filename, size, report.delivered
            );
        }
        Ok(report)
    }

    async fn on_save_changed(&self, path: &Path) {
        let key = match self.session_key() {
            Ok(key) => key,
            Err(e) => {
                debug!("Ignoring save change: {}", e);
                return;
            }
        };

        let filename = match save_filename(path) {
            Ok(name) => name,
            Err(e) => {
                warn!("Ignoring save change: {}", e);
                return;
            }
        };

        let payload = match tokio::fs::read(path).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                return;
            }
        };

        if self.echo.is_echo(&filename, &sha256_hex(&payload)) {
            debug!("Skipping {}: just received from a peer", filename);
            return;
        }

        if let Err(e) = self.broadcast_save(filename, payload, key.as_ref()).await {
            error!("Failed to push {}: {}", path.display(), e);
        }
    }

    async fn accept(
        self: &Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        hello: &[u8],
        key: Option<SessionKey>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", addr, e);
        }
        let (read_half, write_half) = stream.into_split();

        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let peer = Arc::new(PeerConnection::new(id, addr, write_half));
        if let Err(e) = peer.send(hello).await {
            warn!("Failed to send handshake to {}: {}", addr, e);
            return;
        }

        self.registry.add(Arc::clone(&peer));
        info!("Peer connected: {}", addr);

        let inbound = Inbound::new(self.ctx.clone(), Arc::clone(&self.echo));
        let limits = self.ctx.config.limits;
        let host = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut reader = FrameReader::with_limits(BufReader::new(read_half), limits);
            let peer_name = addr.to_string();
            if let StreamEnd::Failed(e) = inbound.run(&mut reader, key.as_ref(), &peer_name).await {
                debug!("Handler for {} ended: {}", peer_name, e);
            }

            if let Some(host) = host.upgrade() {
                if let Some(peer) = host.registry.remove(id) {
                    peer.shutdown().await;
                }
            }
            info!("Peer disconnected: {}", peer_name);
        });
        peer.attach_read_task(task);
    }
}

impl Drop for HostInner {
    fn drop(&mut self) {
        if let HostState::Listening(listening) = &*self.lock_state() {
            listening.accept_task.abort();
        }
    }
}

async fn accept_loop(
    host: Weak<HostInner>,
    listener: TcpListener,
    hello: Vec<u8>,
    key: Option<SessionKey>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let Some(host) = host.upgrade() else {
            break;
        };
        host.accept(stream, addr, &hello, key.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use save_sync_core::{EventBus, StateStore};
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    fn host(temp: &TempDir) -> SessionHost {
        let mut config = Config::with_dirs(temp.path().join("saves"), temp.path().join("inbox"));
        config.port = 0;
        config.bind_host = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let store = Arc::new(StateStore::new(Arc::new(EventBus::new())));
        SessionHost::new(SessionContext::with_state_store(config, store))
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_is_terminal() {
        let temp = TempDir::new().unwrap();
        let host = host(&temp);

        let addr = host.start(None).await.unwrap();
        assert_eq!(host.start(None).await.unwrap(), addr);
        assert!(host.is_running());
        assert!(!host.signing_enabled());

        host.stop().await;
        host.stop().await;
        assert!(!host.is_running());
        assert!(matches!(host.start(None).await, Err(SessionError::Stopped)));
    }

    #[tokio::test]
    async fn test_empty_password_means_unsigned() {
        let temp = TempDir::new().unwrap();
        let host = host(&temp);
        host.start(Some("")).await.unwrap();
        assert!(!host.signing_enabled());
        host.stop().await;
    }

    #[tokio::test]
    async fn test_push_before_start_fails() {
        let temp = TempDir::new().unwrap();
        let host = host(&temp);
        let result = host.push_state_update(&StateDiff::new()).await;
        assert!(matches!(result, Err(SessionError::NotRunning)));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_an_error() {
        let temp = TempDir::new().unwrap();
        let first = host(&temp);
        let addr = first.start(None).await.unwrap();

        let mut config = Config::with_dirs(temp.path().join("saves"), temp.path().join("inbox"));
        config.bind_host = addr.ip();
        config.port = addr.port();
        let store = Arc::new(StateStore::new(Arc::new(EventBus::new())));
        let second = SessionHost::new(SessionContext::with_state_store(config, store));

        assert!(matches!(
            second.start(None).await,
            Err(SessionError::Bind { .. })
        ));
        first.stop().await;
    }

    #[tokio::test]
    async fn test_push_with_no_peers_is_a_no_op() {
        let temp = TempDir::new().unwrap();
        let host = host(&temp);
        host.start(None).await.unwrap();

        let path = temp.path().join("ark.z2s");
        tokio::fs::write(&path, b"zoo").await.unwrap();
        let report = host.push_save(&path).await.unwrap();

        assert_eq!(report, BroadcastReport::default());
        host.stop().await;
    }

    #[tokio::test]
    async fn test_push_missing_file_fails() {
        let temp = TempDir::new().unwrap();
        let host = host(&temp);
        host.start(None).await.unwrap();

        let result = host.push_save(temp.path().join("missing.z2s")).await;

        assert!(matches!(result, Err(SessionError::ReadSave { .. })));
        host.stop().await;
    }

    #[tokio::test]
    async fn test_accepted_socket_receives_hello_first() {
        let temp = TempDir::new().unwrap();
        let host = host(&temp);
        let addr = host.start(Some("zoo123")).await.unwrap();
        assert!(host.signing_enabled());

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut reader = FrameReader::new(BufReader::new(stream));
        let hello = reader.read_hello().await.unwrap();

        assert!(hello.signing_enabled());
        host.stop().await;
    }

    #[tokio::test]
    async fn test_disconnected_peer_is_removed() {
        let temp = TempDir::new().unwrap();
        let host = host(&temp);
        let addr = host.start(None).await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        for _ in 0..100 {
            if host.peer_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(host.peers(), vec![stream.local_addr().unwrap().to_string()]);

        stream.shutdown().await.unwrap();
        drop(stream);
        for _ in 0..100 {
            if host.peer_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(host.peer_count(), 0);
        assert!(host.peers().is_empty());
        host.stop().await;
    }
}
