//! Exclusive locks on cache directories.
//!
//! Two layers: a keyed async mutex serializes tasks inside this process, and
//! on unix an advisory `flock` on a `<cache>.lock` sibling file serializes
//! separate engine processes sharing a cache directory.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// Errors from acquiring a cache lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Cannot lock cache {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Registry of cache locks shared by every runner of one engine.
#[derive(Debug, Default)]
pub struct CacheLocks {
    locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
    active: Arc<AtomicUsize>,
}

impl CacheLocks {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of guards currently held.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait for exclusive use of one cache directory.
    pub async fn acquire(&self, path: &Path) -> Result<CacheLockGuard, LockError> {
        let local = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Entries only the map refers to are idle.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(path.to_path_buf()).or_default().clone()
        };
        let local = local.lock_owned().await;

        let lock_path = lock_file_path(path);
        let file = tokio::task::spawn_blocking(move || FileLock::exclusive(&lock_path))
            .await
            .map_err(|e| LockError::Io {
                path: path.to_path_buf(),
                source: io::Error::other(e),
            })?
            .map_err(|source| LockError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        self.active.fetch_add(1, Ordering::SeqCst);
        debug!(cache = %path.display(), "Acquired cache lock");
        Ok(CacheLockGuard {
            path: path.to_path_buf(),
            _file: file,
            _local: local,
            active: self.active.clone(),
        })
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Lock several caches. Paths are taken in sorted order so that two tasks
    /// sharing caches cannot deadlock.
    pub async fn acquire_all<I>(&self, paths: I) -> Result<Vec<CacheLockGuard>, LockError>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut paths: Vec<PathBuf> = paths.into_iter().collect();
        paths.sort();
        paths.dedup();

        let mut guards = Vec::with_capacity(paths.len());
        for path in paths {
            guards.push(self.acquire(&path).await?);
        }
        Ok(guards)
    }
}

/// Held while a task owns a cache. Released on drop.
pub struct CacheLockGuard {
    path: PathBuf,
    // Fields drop in order: the file lock goes before the in-process one.
    _file: FileLock,
    _local: OwnedMutexGuard<()>,
    active: Arc<AtomicUsize>,
}

impl CacheLockGuard {
    /// The locked cache directory.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheLockGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        debug!(cache = %self.path.display(), "Released cache lock");
    }
}

fn lock_file_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "cache".into());
    name.push(".lock");
    path.with_file_name(name)
}

/// An exclusive advisory lock on a file, held until dropped. Only unix
/// hosts lock; elsewhere the file is merely kept open.
pub(crate) struct FileLock {
    #[cfg(unix)]
    _file: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

impl FileLock {
    /// Block until the lock on `path` is ours. Creates the file.
    pub(crate) fn exclusive(path: &Path) -> io::Result<Self> {
        let file = open_lock_file(path)?;
        #[cfg(unix)]
        let file = nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusive)
            .map_err(|(_, errno)| io::Error::from(errno))?;
        Ok(Self { _file: file })
    }

    /// Take the lock on `path` if no one holds it.
    pub(crate) fn try_exclusive(path: &Path) -> io::Result<Option<Self>> {
        let file = open_lock_file(path)?;
        #[cfg(unix)]
        let file = {
            use nix::errno::Errno;
            use nix::fcntl::{Flock, FlockArg};

            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(file) => file,
                Err((_, errno)) if errno == Errno::EWOULDBLOCK => return Ok(None),
                Err((_, errno)) => return Err(errno.into()),
            }
        };
        Ok(Some(Self { _file: file }))
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
}
