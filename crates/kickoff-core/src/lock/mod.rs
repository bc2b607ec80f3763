//! Mutual exclusion for read-modify-write sequences on one logical key

mod file;
mod process;

use std::future::Future;
use std::path::Path;

use tokio::sync::OwnedMutexGuard;

pub use file::{FileLock, LockFileMeta};
pub use process::ProcessLock;

use crate::config::SyncSettings;
use crate::error::Result;
use file::LockFile;

/// Proof of exclusive access to a key; released on drop
#[derive(Debug)]
pub struct LockGuard {
    key: String,
    // Declared first so the file is removed before same-process waiters wake
    _file: Option<LockFile>,
    _slot: OwnedMutexGuard<()>,
}

impl LockGuard {
    pub(crate) fn new(key: &str, slot: OwnedMutexGuard<()>, file: Option<LockFile>) -> Self {
        Self {
            key: key.to_string(),
            _file: file,
            _slot: slot,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Trait for keyed locks
pub trait Lock: Send + Sync {
    /// Wait until `key` is free and take it
    fn acquire(&self, key: &str) -> impl Future<Output = Result<LockGuard>> + Send;

    /// Run `f` while holding `key`
    fn with_lock<T, F, Fut>(&self, key: &str, f: F) -> impl Future<Output = Result<T>> + Send
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        async move {
            let _guard = self.acquire(key).await?;
            f().await
        }
    }
}

/// Lock implementation chosen at startup
#[derive(Clone)]
pub enum CrossContextLock {
    /// Exclusive across every process sharing the lock directory
    File(FileLock),
    /// Exclusive within this process only
    Process(ProcessLock),
}

impl CrossContextLock {
    /// Use lock files when `dir` is writable, otherwise fall back to the in-process lock
    pub fn probe(dir: Option<&Path>, settings: &SyncSettings) -> Self {
        let Some(dir) = dir else {
            tracing::warn!("No lock directory; writers in other processes are not excluded");
            return Self::Process(ProcessLock::new());
        };

        match FileLock::new(dir, settings.lock_timeout(), settings.stale_lock_after())
            .and_then(|lock| probe_writable(&lock).map(|()| lock))
        {
            Ok(lock) => {
                tracing::debug!("Using file locks in {}", dir.display());
                Self::File(lock)
            }
            Err(error) => {
                tracing::warn!(
                    "Lock directory {} unusable ({error}); writers in other processes are not excluded",
                    dir.display()
                );
                Self::Process(ProcessLock::new())
            }
        }
    }

    pub const fn is_cross_process(&self) -> bool {
        matches!(self, Self::File(_))
    }
}

fn probe_writable(lock: &FileLock) -> Result<()> {
    let probe = lock.dir().join(format!(".probe-{}", std::process::id()));
    std::fs::write(&probe, b"")?;
    std::fs::remove_file(&probe)?;
    Ok(())
}

impl Lock for CrossContextLock {
    async fn acquire(&self, key: &str) -> Result<LockGuard> {
        match self {
            Self::File(lock) => lock.acquire(key).await,
            Self::Process(lock) => lock.acquire(key).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_probe_prefers_file_lock() {
        let tmp = tempdir().unwrap();
        let lock = CrossContextLock::probe(Some(tmp.path()), &SyncSettings::default());
        assert!(lock.is_cross_process());
    }

    #[test]
    fn test_probe_falls_back_without_directory() {
        let lock = CrossContextLock::probe(None, &SyncSettings::default());
        assert!(!lock.is_cross_process());
    }

    #[test]
    fn test_probe_falls_back_when_directory_unusable() {
        let tmp = tempdir().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let lock = CrossContextLock::probe(Some(&blocker.join("locks")), &SyncSettings::default());
        assert!(!lock.is_cross_process());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_with_lock_returns_closure_result() {
        let lock = CrossContextLock::Process(ProcessLock::new());
        let value = lock.with_lock("k", || async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
    }
}
