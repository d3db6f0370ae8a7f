//! Individual peer connection management.
//!
//! A connection owns the write half of a TCP stream. The read half is driven
//! by a separate handler task whose handle is attached here so the connection
//! can be torn down from outside. The socket closes once the write half is
//! released here and the read half is dropped by its task.

use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::debug;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// One connected peer.
pub struct PeerConnection {
    id: u64,
    addr: SocketAddr,
    /// Serializes whole frames so concurrent broadcasts never interleave.
    /// `None` once shut down.
    writer: tokio::sync::Mutex<Option<Writer>>,
    /// Handle to the read task
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerConnection {
    pub fn new(
        id: u64,
        addr: SocketAddr,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            id,
            addr,
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            read_task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Attach the task reading from this peer.
    pub fn attach_read_task(&self, task: JoinHandle<()>) {
        *self.read_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    /// Write one encoded frame.
    pub async fn send(&self, frame: &[u8]) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(io::ErrorKind::NotConnected)?;
        writer.write_all(frame).await?;
        writer.flush().await
    }

    /// Shut down and release the write side. Later sends fail.
    pub async fn shutdown(&self) {
        let Some(mut writer) = self.writer.lock().await.take() else {
            return;
        };
        if let Err(e) = writer.shutdown().await {
            debug!("Shutdown of {} failed: {}", self.addr, e);
        }
    }

    /// Shut down the write side and abort the read task.
    pub async fn close(&self) {
        self.shutdown().await;
        if let Some(task) = self
            .read_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        if let Some(task) = self
            .read_task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_send_writes_whole_frame() {
        let (client, mut server) = tokio::io::duplex(64);
        let conn = PeerConnection::new(1, addr(), client);

        conn.send(b"TEXT\n\x00\x00\x00\x01!").await.unwrap();

        let mut buf = [0u8; 10];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"TEXT\n\x00\x00\x00\x01!");
    }

    #[tokio::test]
    async fn test_shutdown_releases_writer() {
        let (client, mut server) = tokio::io::duplex(64);
        let conn = PeerConnection::new(1, addr(), client);

        conn.shutdown().await;
        conn.shutdown().await;

        let err = conn.send(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_close_aborts_read_task() {
        let (client, _server) = tokio::io::duplex(64);
        let conn = PeerConnection::new(1, addr(), client);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        });
        conn.attach_read_task(task);

        conn.close().await;

        // The aborted task drops its sender.
        assert!(rx.await.is_err());
    }
}
