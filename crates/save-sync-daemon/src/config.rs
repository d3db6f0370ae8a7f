use save_sync_core::protocol::FrameLimits;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 5000;

/// Default save file extension (without the dot).
pub const DEFAULT_SAVE_EXTENSION: &str = "z2s";

/// Shortest allowed settle delay before a changed save is acted on.
pub const MIN_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Public DNS address used for the local-interface lookup. No data is sent.
pub const DEFAULT_ROUTE_ADDR: &str = "8.8.8.8:80";

/// Public IP echo endpoint.
pub const DEFAULT_IP_ECHO_URL: &str = "https://api.ipify.org";

/// Save directories tried, in order, under `$APPDATA`.
const SAVE_DIR_CANDIDATES: &[&str] = &[
    "Microsoft Games/Zoo Tycoon 2/Default Profile/Saved",
    "Microsoft Games/Zoo Tycoon 2/Default Profile/Saved Games",
];

/// Session configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the host listens on and clients connect to by default
    pub port: u16,
    /// Interface the host binds to
    pub bind_host: IpAddr,
    /// Explicit save directory, bypassing candidate lookup
    pub save_dir: Option<PathBuf>,
    /// Per-user application data root (`APPDATA`)
    pub appdata: Option<PathBuf>,
    /// Staging directory for received saves
    pub inbox_dir: PathBuf,
    /// Save file extension, without the dot
    pub save_extension: String,
    /// Quiet period after a save changes before it is read
    pub settle_delay: Duration,
    /// Peer-declared size bounds
    pub limits: FrameLimits,
    /// Session password, if supplied through the environment
    pub password: Option<String>,
    pub route_addr: String,
    pub ip_echo_url: String,
}

impl Config {
    /// Configuration with defaults and explicit save and inbox directories.
    pub fn with_dirs(save_dir: impl Into<PathBuf>, inbox_dir: impl Into<PathBuf>) -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            save_dir: Some(save_dir.into()),
            appdata: None,
            inbox_dir: inbox_dir.into(),
            save_extension: DEFAULT_SAVE_EXTENSION.to_string(),
            settle_delay: MIN_SETTLE_DELAY,
            limits: FrameLimits::default(),
            password: None,
            route_addr: DEFAULT_ROUTE_ADDR.to_string(),
            ip_echo_url: DEFAULT_IP_ECHO_URL.to_string(),
        }
    }

    /// Load configuration from the process environment.
    ///
    /// Recognized variables:
    /// - `APPDATA`: base for the save directory and inbox
    /// - `SAVE_SYNC_PORT`: listening/connect port (default 5000)
    /// - `SAVE_SYNC_SAVE_DIR`: explicit save directory
    /// - `SAVE_SYNC_INBOX_DIR`: explicit inbox directory
    /// - `SAVE_SYNC_PASSWORD`: session password
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match var("SAVE_SYNC_PORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort(raw))?,
            None => DEFAULT_PORT,
        };

        let appdata = var("APPDATA").map(PathBuf::from);

        let inbox_dir = match var("SAVE_SYNC_INBOX_DIR") {
            Some(dir) => expand_tilde(&dir),
            None => appdata
                .clone()
                .or_else(dirs::home_dir)
                .map(|base| base.join("SaveSync").join("Incoming"))
                .ok_or(ConfigError::NoInboxDir)?,
        };

        Ok(Self {
            port,
            save_dir: var("SAVE_SYNC_SAVE_DIR").map(|d| expand_tilde(&d)),
            appdata,
            inbox_dir,
            password: var("SAVE_SYNC_PASSWORD"),
            ..Self::with_dirs(PathBuf::new(), PathBuf::new())
        })
    }

    /// Locate the game's save directory.
    ///
    /// An explicit directory always wins. Otherwise the first existing
    /// candidate under `APPDATA` is used.
    pub fn resolve_save_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.save_dir {
            return Ok(dir.clone());
        }

        let appdata = self.appdata.as_deref().ok_or(ConfigError::SaveDirNotFound)?;
        candidate_save_dirs(appdata)
            .into_iter()
            .find(|p| p.is_dir())
            .ok_or(ConfigError::SaveDirNotFound)
    }

    /// Settle delay, never shorter than the minimum.
    pub fn effective_settle_delay(&self) -> Duration {
        self.settle_delay.max(MIN_SETTLE_DELAY)
    }
}

fn candidate_save_dirs(appdata: &Path) -> Vec<PathBuf> {
    SAVE_DIR_CANDIDATES
        .iter()
        .map(|rel| appdata.join(rel))
        .collect()
}

/// Expand ~ or ~/ prefix to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("SAVE_SYNC_PORT is not a valid port: {0:?}")]
    InvalidPort(String),

    #[error("Game save directory not found (set SAVE_SYNC_SAVE_DIR or APPDATA)")]
    SaveDirNotFound,

    #[error("No inbox directory: neither APPDATA nor a home directory is available")]
    NoInboxDir,
}
