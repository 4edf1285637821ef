//! Persisted bearer token for the historical-archive provider.
//!
//! The token outlives a single run and is shared by every run on the host, so
//! rotation is guarded by an advisory lock next to the token file.

use fs2::FileExt;
use parking_lot::Mutex;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info};

/// Errors from token persistence and locking.
#[derive(Debug)]
pub enum TokenStoreError {
    Io(io::Error),
    LockTimeout { waited: Duration },
}

impl fmt::Display for TokenStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "token store I/O error: {}", e),
            Self::LockTimeout { waited } => {
                write!(f, "timed out after {:?} waiting for the token lock", waited)
            }
        }
    }
}

impl std::error::Error for TokenStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::LockTimeout { .. } => None,
        }
    }
}

impl From<io::Error> for TokenStoreError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Held while a rotation is in progress. Released on drop.
pub struct RotationGuard {
    file: Option<File>,
}

impl RotationGuard {
    fn in_process() -> Self {
        Self { file: None }
    }
}

impl Drop for RotationGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
    }
}

/// Storage for the shared archive token.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Result<Option<String>, TokenStoreError>;

    fn save(&self, token: &str) -> Result<(), TokenStoreError>;

    /// Try to take the rotation lock without blocking.
    fn try_lock(&self) -> Result<Option<RotationGuard>, TokenStoreError>;
}

/// Poll [`TokenStore::try_lock`] until it succeeds or `wait` elapses.
pub async fn acquire_rotation_lock(
    store: &dyn TokenStore,
    wait: Duration,
    poll: Duration,
) -> Result<RotationGuard, TokenStoreError> {
    let started = Instant::now();
    loop {
        if let Some(guard) = store.try_lock()? {
            return Ok(guard);
        }
        let waited = started.elapsed();
        if waited >= wait {
            return Err(TokenStoreError::LockTimeout { waited });
        }
        debug!("Token rotation lock held elsewhere, waiting");
        sleep(poll).await;
    }
}

// =============================================================================
// FILE STORE
// =============================================================================

/// Plain-text token file plus a sibling `.lock` file.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<Option<String>, TokenStoreError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                let token = contents.trim();
                Ok((!token.is_empty()).then(|| token.to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, token: &str) -> Result<(), TokenStoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        fs::write(&tmp_path, token)?;
        fs::rename(&tmp_path, &self.path)?;
        info!(path = %self.path.display(), "Saved archive token");
        Ok(())
    }

    fn try_lock(&self) -> Result<Option<RotationGuard>, TokenStoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(RotationGuard { file: Some(file) })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// MEMORY STORE
// =============================================================================

/// Token held in memory. For tests and single-process use.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<String>>,
}

impl MemoryTokenStore {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: Mutex::new(token),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<String>, TokenStoreError> {
        Ok(self.token.lock().clone())
    }

    fn save(&self, token: &str) -> Result<(), TokenStoreError> {
        *self.token.lock() = Some(token.to_string());
        Ok(())
    }

    fn try_lock(&self) -> Result<Option<RotationGuard>, TokenStoreError> {
        Ok(Some(RotationGuard::in_process()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("nested").join("archive.token"));
        assert_eq!(store.load().unwrap(), None);
        store.save("abc123").unwrap();
        assert_eq!(store.load().unwrap(), Some("abc123".to_string()));
        fs::write(store.path(), "  xyz\n").unwrap();
        assert_eq!(store.load().unwrap(), Some("xyz".to_string()));
    }

    #[test]
    fn test_file_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let a = FileTokenStore::new(dir.path().join("archive.token"));
        let b = FileTokenStore::new(dir.path().join("archive.token"));

        let guard = a.try_lock().unwrap();
        assert!(guard.is_some());
        assert!(b.try_lock().unwrap().is_none());
        drop(guard);
        assert!(b.try_lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_acquire_times_out_while_held() {
        let dir = tempdir().unwrap();
        let a = FileTokenStore::new(dir.path().join("archive.token"));
        let b = FileTokenStore::new(dir.path().join("archive.token"));
        let _held = a.try_lock().unwrap();

        let result =
            acquire_rotation_lock(&b, Duration::from_millis(50), Duration::from_millis(10)).await;
        assert!(matches!(result, Err(TokenStoreError::LockTimeout { .. })));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryTokenStore::new(None);
        assert_eq!(store.load().unwrap(), None);
        store.save("t").unwrap();
        assert_eq!(store.load().unwrap(), Some("t".to_string()));
        assert!(store.try_lock().unwrap().is_some());
    }
}
