//! Cross-process lock backed by exclusive lock files

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::process::ProcessLock;
use super::{Lock, LockGuard};
use crate::error::{Error, Result};
use crate::util::now_millis;

const INITIAL_POLL: Duration = Duration::from_millis(10);
const MAX_POLL: Duration = Duration::from_millis(250);

static TOMBSTONES: AtomicU64 = AtomicU64::new(0);

/// Contents of a lock file, used to diagnose and break abandoned locks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockFileMeta {
    pub key: String,
    pub pid: u32,
    pub acquired_at_ms: i64,
}

/// A lock file as it was when judged abandoned
#[derive(Debug, PartialEq, Eq)]
struct Snapshot {
    contents: Vec<u8>,
    modified: Option<SystemTime>,
}

fn snapshot(path: &Path) -> io::Result<Snapshot> {
    let contents = fs::read(path)?;
    let modified = fs::metadata(path).and_then(|meta| meta.modified()).ok();
    Ok(Snapshot { contents, modified })
}

/// Held lock file; removed when dropped
#[derive(Debug)]
pub(crate) struct LockFile {
    path: PathBuf,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(error) = fs::remove_file(&self.path) {
            if error.kind() != io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove lock file {}: {error}", self.path.display());
            }
        }
    }
}

/// Lock shared by every process using the same lock directory
#[derive(Clone)]
pub struct FileLock {
    dir: PathBuf,
    process: ProcessLock,
    timeout: Duration,
    stale_after: Duration,
}

impl FileLock {
    /// Create the lock directory if needed
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration, stale_after: Duration) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            process: ProcessLock::new(),
            timeout,
            stale_after,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the lock file guarding `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.lock"))
    }

    fn try_create(&self, path: &Path, key: &str) -> io::Result<LockFile> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let lock = LockFile {
            path: path.to_path_buf(),
        };

        let meta = LockFileMeta {
            key: key.to_string(),
            pid: std::process::id(),
            acquired_at_ms: now_millis(),
        };
        serde_json::to_writer(&mut file, &meta).map_err(io::Error::other)?;
        file.flush()?;
        Ok(lock)
    }

    /// The existing lock file, if it outlived the stale window
    fn stale_snapshot(&self, path: &Path) -> Option<Snapshot> {
        let current = snapshot(path).ok()?;
        let stale_ms = i64::try_from(self.stale_after.as_millis()).unwrap_or(i64::MAX);
        let stale = match serde_json::from_slice::<LockFileMeta>(&current.contents) {
            Ok(meta) => now_millis().saturating_sub(meta.acquired_at_ms) > stale_ms,
            // A holder may crash between create and write, leaving an empty file
            Err(_) => current
                .modified
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .is_some_and(|age| age > self.stale_after),
        };
        stale.then_some(current)
    }

    /// Remove the lock file only if it is still the one judged stale.
    ///
    /// The file is first renamed to a private tombstone, so a waiter that broke
    /// the lock and re-created it in the meantime keeps its file.
    fn break_stale(&self, path: &Path, judged: &Snapshot) -> io::Result<bool> {
        let name = path
            .file_name()
            .map_or_else(String::new, |name| name.to_string_lossy().into_owned());
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_nanos());
        let tombstone = self.dir.join(format!(
            ".{name}.stale-{}-{nanos}-{}",
            std::process::id(),
            TOMBSTONES.fetch_add(1, Ordering::Relaxed)
        ));

        match fs::rename(path, &tombstone) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(error) => return Err(error),
        }

        let moved = snapshot(&tombstone);
        if moved.as_ref().is_ok_and(|moved| moved == judged) {
            fs::remove_file(&tombstone)?;
            return Ok(true);
        }

        // A live holder's file was moved aside; put it back unless the path is taken again
        match fs::hard_link(&tombstone, path) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                tracing::warn!("Lock file {} was re-created while restoring it", path.display());
            }
            Err(error) => {
                tracing::warn!("Failed to restore lock file {}: {error}", path.display());
            }
        }
        fs::remove_file(&tombstone)?;
        Ok(false)
    }
}

impl Lock for FileLock {
    async fn acquire(&self, key: &str) -> Result<LockGuard> {
        let slot = self.process.acquire_slot(key).await;
        let path = self.path_for(key);
        let started = Instant::now();
        let mut poll = INITIAL_POLL;

        loop {
            match self.try_create(&path, key) {
                Ok(file) => return Ok(LockGuard::new(key, slot, Some(file))),
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {}
                Err(error) => return Err(error.into()),
            }

            if let Some(judged) = self.stale_snapshot(&path) {
                if self.break_stale(&path, &judged)? {
                    tracing::warn!("Broke stale lock file {}", path.display());
                }
                continue;
            }

            if started.elapsed() >= self.timeout {
                return Err(Error::Lock(format!(
                    "timed out after {:?} waiting for '{key}'",
                    self.timeout
                )));
            }

            tokio::time::sleep(poll).await;
            poll = (poll * 2).min(MAX_POLL);
        }
    }
}
