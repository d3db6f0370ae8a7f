//! Session client: joins a host and applies what it broadcasts.

use crate::connection::PeerConnection;
use crate::dispatch::{Inbound, StreamEnd};
use crate::save_store::EchoGuard;
use crate::session::{derive_key, save_filename, SessionContext, SessionError};
use crate::watcher::ReloadWatcher;
use save_sync_core::protocol::SaveFrame;
use save_sync_core::{Frame, FrameError, FrameReader, SessionKey, StateDiff};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Progress of the opening handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStatus {
    Pending,
    Ready { signing: bool },
    PasswordRequired,
    Failed(String),
}

/// How a client's receive loop ended.
#[derive(Debug)]
pub enum ClientExit {
    /// The host closed the connection.
    Closed,
    /// The host sent something undecodable.
    Failed(FrameError),
    /// The session was abandoned before or instead of reading frames.
    Aborted(SessionError),
}

/// A joined session. Dropping the handle disconnects.
pub struct ClientHandle {
    conn: Arc<PeerConnection>,
    key: Arc<RwLock<Option<SessionKey>>>,
    status: watch::Receiver<HandshakeStatus>,
    reload: Arc<ReloadWatcher>,
    task: Option<JoinHandle<ClientExit>>,
}

/// Connect to a host. `host` may omit the port, in which case the configured
/// port is used.
///
/// Returns as soon as the TCP connection is open; the handshake completes in
/// the background (see `ClientHandle::wait_ready`).
pub async fn join(host: &str, ctx: SessionContext) -> Result<ClientHandle, SessionError> {
    let target = with_default_port(host, ctx.config.port);
    let stream = TcpStream::connect(&target)
        .await
        .map_err(|source| SessionError::Connect {
            addr: target.clone(),
            source,
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {}: {}", target, e);
    }
    let peer_addr = stream.peer_addr()?;
    let (read_half, write_half) = stream.into_split();
    info!("Connected to {}", peer_addr);

    let conn = Arc::new(PeerConnection::new(0, peer_addr, write_half));
    let key = Arc::new(RwLock::new(None));
    let (status_tx, status) = watch::channel(HandshakeStatus::Pending);
    let reload = Arc::new(ReloadWatcher::new(
        Arc::clone(&ctx.events),
        &ctx.config.save_extension,
        ctx.config.effective_settle_delay(),
    ));

    let task = tokio::spawn(receive_loop(
        read_half,
        Arc::clone(&conn),
        ctx,
        Arc::clone(&key),
        status_tx,
        Arc::clone(&reload),
    ));

    Ok(ClientHandle {
        conn,
        key,
        status,
        reload,
        task: Some(task),
    })
}

fn with_default_port(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.parse::<SocketAddr>().is_ok() {
        return host.to_string();
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return SocketAddr::new(ip, port).to_string();
    }
    match host.rsplit_once(':') {
        Some((name, p)) if !name.is_empty() && p.parse::<u16>().is_ok() => host.to_string(),
        _ => format!("{host}:{port}"),
    }
}

async fn receive_loop(
    read_half: OwnedReadHalf,
    conn: Arc<PeerConnection>,
    ctx: SessionContext,
    key_slot: Arc<RwLock<Option<SessionKey>>>,
    status: watch::Sender<HandshakeStatus>,
    reload: Arc<ReloadWatcher>,
) -> ClientExit {
    let peer = conn.addr().to_string();
    let mut reader = FrameReader::with_limits(BufReader::new(read_half), ctx.config.limits);

    let hello = match reader.read_hello().await {
        Ok(hello) => hello,
        Err(e) => {
            warn!("Handshake with {} failed: {}", peer, e);
            status.send_replace(HandshakeStatus::Failed(e.to_string()));
            conn.shutdown().await;
            return ClientExit::Failed(e);
        }
    };

    let key = match hello.salt() {
        None => None,
        Some(salt) => {
            let Some(password) = ctx.delegate.session_password().filter(|p| !p.is_empty()) else {
                // Returning drops the read half; with the writer released the socket closes.
                error!("{} requires a session password; disconnecting", peer);
                status.send_replace(HandshakeStatus::PasswordRequired);
                conn.shutdown().await;
                return ClientExit::Aborted(SessionError::PasswordRequired);
            };
            match derive_key(password, *salt).await {
                Ok(key) => Some(key),
                Err(e) => {
                    status.send_replace(HandshakeStatus::Failed(e.to_string()));
                    conn.shutdown().await;
                    return ClientExit::Aborted(e);
                }
            }
        }
    };

    *key_slot.write().unwrap_or_else(|e| e.into_inner()) = key.clone();
    status.send_replace(HandshakeStatus::Ready {
        signing: key.is_some(),
    });
    info!(
        "Joined session at {} (signing {})",
        peer,
        if key.is_some() { "on" } else { "off" }
    );

    let inbound =
        Inbound::new(ctx, Arc::new(EchoGuard::new())).with_reload_watcher(Arc::clone(&reload));
    let end = inbound.run(&mut reader, key.as_ref(), &peer).await;

    reload.stop();
    conn.shutdown().await;
    info!("Left session at {}", peer);

    match end {
        StreamEnd::Closed => ClientExit::Closed,
        StreamEnd::Failed(e) => ClientExit::Failed(e),
    }
}

impl ClientHandle {
    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.addr()
    }

    /// Wait for the handshake. Returns whether the session is signed.
    pub async fn wait_ready(&self) -> Result<bool, SessionError> {
        let mut status = self.status.clone();
        let result = status
            .wait_for(|s| *s != HandshakeStatus::Pending)
            .await
            .map(|s| s.clone());
        match result {
            Ok(HandshakeStatus::Ready { signing }) => Ok(signing),
            Ok(HandshakeStatus::PasswordRequired) => Err(SessionError::PasswordRequired),
            Ok(HandshakeStatus::Failed(reason)) => Err(SessionError::Handshake(reason)),
            Ok(HandshakeStatus::Pending) | Err(_) => Err(SessionError::Disconnected),
        }
    }

    /// Resolves once the receive loop has ended, for any reason.
    pub async fn closed(&self) {
        let mut status = self.status.clone();
        while status.changed().await.is_ok() {}
    }

    /// Wait for the receive loop to end and report why.
    pub async fn wait(mut self) -> ClientExit {
        let Some(task) = self.task.take() else {
            return ClientExit::Aborted(SessionError::Disconnected);
        };
        match task.await {
            Ok(exit) => exit,
            Err(e) => {
                debug!("Receive loop did not finish: {}", e);
                ClientExit::Aborted(SessionError::Disconnected)
            }
        }
    }

    /// Disconnect from the host.
    pub async fn close(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
        self.reload.stop();
        self.conn.shutdown().await;
        info!("Disconnected from {}", self.conn.addr());
    }

    /// Send a local save file to the host.
    pub async fn push_save(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let path = path.as_ref();
        self.wait_ready().await?;
        let filename = save_filename(path)?;
        let payload = tokio::fs::read(path)
            .await
            .map_err(|source| SessionError::ReadSave {
                path: path.to_path_buf(),
                source,
            })?;

        let key = self.key.read().unwrap_or_else(|e| e.into_inner()).clone();
        let frame = SaveFrame::new(filename, payload, key.as_ref())?;
        self.conn.send(&frame.encode()?).await?;
        info!("Sent {} ({} bytes) to {}", frame.filename, frame.size(), self.conn.addr());
        Ok(())
    }

    /// Send a state diff to the host.
    pub async fn push_state_update(&self, diff: &StateDiff) -> Result<(), SessionError> {
        self.wait_ready().await?;
        self.conn.send(&Frame::state(diff).encode()?).await?;
        Ok(())
    }

    /// Send a text message to the host.
    pub async fn send_text(&self, message: &str) -> Result<(), SessionError> {
        self.wait_ready().await?;
        self.conn
            .send(&Frame::Text(message.to_string()).encode()?)
            .await?;
        Ok(())
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use save_sync_core::{EventBus, Hello, Salt, StateStore};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_default_port_applied() {
        assert_eq!(with_default_port("192.168.1.5", 5000), "192.168.1.5:5000");
        assert_eq!(with_default_port("192.168.1.5:6000", 5000), "192.168.1.5:6000");
        assert_eq!(with_default_port("zoo.lan", 5000), "zoo.lan:5000");
        assert_eq!(with_default_port("zoo.lan:7000", 5000), "zoo.lan:7000");
        assert_eq!(with_default_port("::1", 5000), "[::1]:5000");
        assert_eq!(with_default_port("[::1]:6000", 5000), "[::1]:6000");
    }

    #[tokio::test]
    async fn test_password_required_closes_socket() {
        let temp = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = Config::with_dirs(temp.path().join("saves"), temp.path().join("inbox"));
        let store = Arc::new(StateStore::new(Arc::new(EventBus::new())));

        let client = join(&addr.to_string(), SessionContext::with_state_store(config, store))
            .await
            .unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        server
            .write_all(&Hello::signed(Salt::random()).encode())
            .await
            .unwrap();

        assert!(matches!(
            client.wait_ready().await,
            Err(SessionError::PasswordRequired)
        ));
        client.closed().await;

        // Handle still alive, yet the connection is gone.
        assert!(client.conn.send(b"TEXT\n").await.is_err());
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
