//! Addresses a host can share with peers.

use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::debug;

/// Placeholder for an address that could not be determined.
pub const UNAVAILABLE: &str = "Unavailable";

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub local_ip: String,
    pub public_ip: String,
    pub port: u16,
}

/// Resolve local and public addresses. Each failure degrades to `UNAVAILABLE`.
pub async fn lookup(route_addr: &str, ip_echo_url: &str, port: u16) -> ConnectionInfo {
    let (local, public) = tokio::join!(local_ip(route_addr), public_ip(ip_echo_url));
    ConnectionInfo {
        local_ip: local.unwrap_or_else(|| UNAVAILABLE.to_string()),
        public_ip: public.unwrap_or_else(|| UNAVAILABLE.to_string()),
        port,
    }
}

/// Run `lookup` in the background and pass the result to `callback`.
pub fn lookup_with<F>(
    route_addr: String,
    ip_echo_url: String,
    port: u16,
    callback: F,
) -> JoinHandle<()>
where
    F: FnOnce(ConnectionInfo) + Send + 'static,
{
    tokio::spawn(async move {
        callback(lookup(&route_addr, &ip_echo_url, port).await);
    })
}

/// Interface address the OS would route `route_addr` through. No packet is sent.
async fn local_ip(route_addr: &str) -> Option<String> {
    let lookup = async {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(route_addr).await?;
        socket.local_addr()
    };
    match tokio::time::timeout(LOOKUP_TIMEOUT, lookup).await {
        Ok(Ok(addr)) if !addr.ip().is_unspecified() => Some(addr.ip().to_string()),
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            debug!("Local address lookup failed: {}", e);
            None
        }
        Err(_) => {
            debug!("Local address lookup timed out");
            None
        }
    }
}

async fn public_ip(url: &str) -> Option<String> {
    let client = reqwest::Client::builder()
        .timeout(LOOKUP_TIMEOUT)
        .build()
        .ok()?;

    let body = match client.get(url).send().await {
        Ok(response) => match response.error_for_status() {
            Ok(response) => response.text().await.ok()?,
            Err(e) => {
                debug!("Public address lookup failed: {}", e);
                return None;
            }
        },
        Err(e) => {
            debug!("Public address lookup failed: {}", e);
            return None;
        }
    };

    let ip: IpAddr = body.trim().parse().ok()?;
    Some(ip.to_string())
}
