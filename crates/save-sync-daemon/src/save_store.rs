//! Writing received saves to disk.
//!
//! A received save is first staged atomically in the inbox, then copied into
//! the game's save directory. An existing save of the same name is renamed to
//! a timestamped backup first, so nothing is ever overwritten in place.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SaveStoreError {
    #[error("Failed to stage {path}: {source}")]
    Stage { path: PathBuf, source: io::Error },

    #[error("Failed to back up {path}: {source}")]
    Backup { path: PathBuf, source: io::Error },

    #[error("Failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// A save that landed in the save directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedSave {
    pub path: PathBuf,
    pub staged: PathBuf,
    pub sha256: String,
    pub backup: Option<PathBuf>,
}

/// Hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Write via a sibling temp file and rename, so readers never see a partial file.
pub async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".part");
    let temp_path = path.with_file_name(temp_name);

    fs::write(&temp_path, data).await?;
    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e);
    }
    Ok(())
}

/// Rename an existing file to `<name>.bak_<YYYYmmdd_HHMMSS>`.
///
/// A numeric suffix is appended when that name is taken. Returns the backup
/// path, or `None` if there was nothing to back up.
pub async fn backup_existing(path: &Path) -> io::Result<Option<PathBuf>> {
    if !fs::try_exists(path).await? {
        return Ok(None);
    }

    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let base = format!("{}.bak_{}", path.display(), stamp);
    let mut backup = PathBuf::from(&base);
    let mut n = 1;
    while fs::try_exists(&backup).await? {
        backup = PathBuf::from(format!("{base}_{n}"));
        n += 1;
    }

    fs::rename(path, &backup).await?;
    Ok(Some(backup))
}

/// Staging inbox plus the apply step into a save directory.
#[derive(Debug, Clone)]
pub struct SaveStore {
    inbox_dir: PathBuf,
}

impl SaveStore {
    pub fn new(inbox_dir: impl Into<PathBuf>) -> Self {
        Self {
            inbox_dir: inbox_dir.into(),
        }
    }

    /// Stage in the inbox, then install into `save_dir` with backup.
    ///
    /// `filename` must already be validated as a single path component.
    pub async fn apply(
        &self,
        save_dir: &Path,
        filename: &str,
        data: &[u8],
    ) -> Result<AppliedSave, SaveStoreError> {
        let staged = self.inbox_dir.join(filename);
        write_atomic(&staged, data)
            .await
            .map_err(|source| SaveStoreError::Stage {
                path: staged.clone(),
                source,
            })?;

        let sha256 = sha256_hex(data);
        debug!("Staged {} ({} bytes) SHA256:{}", filename, data.len(), &sha256[..12]);

        let path = save_dir.join(filename);
        if let Err(source) = fs::create_dir_all(save_dir).await {
            return Err(SaveStoreError::Write {
                path: save_dir.to_path_buf(),
                source,
            });
        }

        let backup = backup_existing(&path)
            .await
            .map_err(|source| SaveStoreError::Backup {
                path: path.clone(),
                source,
            })?;
        if let Some(backup) = &backup {
            info!("Backup created: {}", backup.display());
        }

        write_atomic(&path, data)
            .await
            .map_err(|source| SaveStoreError::Write {
                path: path.clone(),
                source,
            })?;

        Ok(AppliedSave {
            path,
            staged,
            sha256,
            backup,
        })
    }
}

/// Digests of saves applied from the network, keyed by filename.
///
/// The host's save watcher sees its own writes of received saves; matching
/// digests mark those events as echoes that must not be re-broadcast.
#[derive(Debug, Default)]
pub struct EchoGuard {
    applied: Mutex<HashMap<String, String>>,
}

impl EchoGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, filename: &str, sha256: &str) {
        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(filename.to_string(), sha256.to_string());
    }

    pub fn forget(&self, filename: &str) {
        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(filename);
    }

    /// True if this content was just applied from a peer. Consumes the record.
    pub fn is_echo(&self, filename: &str, sha256: &str) -> bool {
        let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        match applied.get(filename) {
            Some(known) if known == sha256 => {
                applied.remove(filename);
                true
            }
            Some(_) => {
                applied.remove(filename);
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backups_of(dir: &Path, name: &str) -> Vec<PathBuf> {
        let prefix = format!("{name}.bak_");
        let mut found: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix))
            })
            .collect();
        found.sort();
        found
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_write_atomic_leaves_no_temp_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/ark.z2s");

        write_atomic(&path, b"zoo").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"zoo");
        assert!(!temp.path().join("nested/ark.z2s.part").exists());
    }

    #[tokio::test]
    async fn test_apply_into_empty_directory() {
        let temp = TempDir::new().unwrap();
        let store = SaveStore::new(temp.path().join("inbox"));
        let saves = temp.path().join("saves");

        let applied = store.apply(&saves, "ark.z2s", b"first").await.unwrap();

        assert_eq!(applied.path, saves.join("ark.z2s"));
        assert_eq!(applied.backup, None);
        assert_eq!(applied.sha256, sha256_hex(b"first"));
        assert_eq!(std::fs::read(&applied.path).unwrap(), b"first");
        assert_eq!(std::fs::read(&applied.staged).unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_overwrite_creates_exactly_one_backup() {
        let temp = TempDir::new().unwrap();
        let store = SaveStore::new(temp.path().join("inbox"));
        let saves = temp.path().join("saves");

        store.apply(&saves, "ark.z2s", b"first").await.unwrap();
        let second = store.apply(&saves, "ark.z2s", b"second").await.unwrap();

        let backups = backups_of(&saves, "ark.z2s");
        assert_eq!(backups.len(), 1);
        assert_eq!(second.backup.as_ref(), Some(&backups[0]));
        assert_eq!(std::fs::read(&backups[0]).unwrap(), b"first");
        assert_eq!(std::fs::read(saves.join("ark.z2s")).unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_backups_within_one_second_do_not_collide() {
        let temp = TempDir::new().unwrap();
        let store = SaveStore::new(temp.path().join("inbox"));
        let saves = temp.path().join("saves");

        store.apply(&saves, "ark.z2s", b"one").await.unwrap();
        store.apply(&saves, "ark.z2s", b"two").await.unwrap();
        store.apply(&saves, "ark.z2s", b"three").await.unwrap();

        let mut contents: Vec<Vec<u8>> = backups_of(&saves, "ark.z2s")
            .iter()
            .map(|p| std::fs::read(p).unwrap())
            .collect();
        contents.sort();
        assert_eq!(contents, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn test_backup_missing_file_is_noop() {
        let temp = TempDir::new().unwrap();
        let result = backup_existing(&temp.path().join("none.z2s")).await.unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_echo_guard() {
        let guard = EchoGuard::new();
        guard.record("ark.z2s", "aaa");

        assert!(!guard.is_echo("other.z2s", "aaa"));
        assert!(guard.is_echo("ark.z2s", "aaa"));
        // Consumed by the first match.
        assert!(!guard.is_echo("ark.z2s", "aaa"));

        guard.record("ark.z2s", "aaa");
        assert!(!guard.is_echo("ark.z2s", "bbb"));
        assert!(!guard.is_echo("ark.z2s", "aaa"));
    }
}
