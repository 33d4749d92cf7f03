//! Local content-addressed image store.
//!
//! Layout under the store root:
//!
//! ```text
//! index.json             repository:tag -> digest
//! store.lock             held while the index or blobs change
//! blobs/<sha256 hex>/    unpacked root filesystems
//! staging/<uuid>/        in-flight fetches
//! staging/<uuid>.lock    held by the process that owns the fetch
//! ```
//!
//! Several engine processes may share one store. Index updates re-read
//! `index.json` under `store.lock` and apply only their own change, and a
//! staging directory is removed only once its lock is free.
//!
//! The store is an explicit object with an owner; nothing here is global.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};

use taskrun_core::ImageRef;

use super::ResolvedImage;
use crate::fsutil;
use crate::lock::FileLock;

const INDEX_FILE: &str = "index.json";
const STORE_LOCK: &str = "store.lock";

type Index = BTreeMap<String, IndexEntry>;

/// One persisted index entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    repository: String,
    tag: String,
    digest: String,
    fetched_at: DateTime<Utc>,
}

/// A private directory for one fetch, locked for as long as it exists.
pub struct Staging {
    path: PathBuf,
    lock_path: PathBuf,
    _lock: FileLock,
}

impl Staging {
    /// Where the fetch writes the root filesystem.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory, if still there, and its lock file.
    pub fn discard(self) -> io::Result<()> {
        fsutil::remove_tree(&self.path)?;
        fsutil::remove_tree(&self.lock_path)
    }
}

/// Cache of resolved images, shared read-only by concurrent sandboxes.
pub struct ImageStore {
    root: PathBuf,

    /// Resolved images indexed by `repository:tag`.
    images: RwLock<HashMap<String, Arc<ResolvedImage>>>,

    /// One lock per reference being pulled.
    pulls: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ImageStore {
    /// Open (or create) a store rooted at `root`.
    ///
    /// Staging directories no live process owns are removed, and index
    /// entries whose blob has disappeared are skipped.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("blobs"))?;
        std::fs::create_dir_all(root.join("staging"))?;

        let index = {
            let _store = FileLock::exclusive(&root.join(STORE_LOCK))?;
            clean_staging(&root.join("staging"))?;
            read_index(&root)?
        };

        let mut images = HashMap::new();
        for (key, entry) in index {
            match loaded(&root, entry) {
                Some(resolved) => {
                    images.insert(key, resolved);
                }
                None => warn!(image = %key, "Skipping index entry without blob"),
            }
        }

        info!(root = %root.display(), images = images.len(), "Opened image store");
        Ok(Self {
            root,
            images: RwLock::new(images),
            pulls: Mutex::new(HashMap::new()),
        })
    }

    /// Store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cached image for a reference, if present. Falls back to the on-disk
    /// index so pulls finished by other processes are found.
    pub async fn lookup(&self, image: &ImageRef) -> Option<Arc<ResolvedImage>> {
        let key = image.cache_key();
        if let Some(hit) = self.images.read().await.get(&key) {
            return Some(hit.clone());
        }

        let root = self.root.clone();
        let index = match tokio::task::spawn_blocking(move || read_index(&root)).await {
            Ok(Ok(index)) => index,
            Ok(Err(e)) => {
                warn!(error = %e, "Cannot read image index");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Image index reader failed");
                return None;
            }
        };
        let resolved = loaded(&self.root, index.get(&key)?.clone())?;

        let mut images = self.images.write().await;
        Some(images.entry(key).or_insert(resolved).clone())
    }

    /// Lock serializing pulls of one reference.
    pub fn pull_lock(&self, image: &ImageRef) -> Arc<AsyncMutex<()>> {
        let mut pulls = self.pulls.lock().unwrap_or_else(|e| e.into_inner());
        pulls.retain(|_, lock| Arc::strong_count(lock) > 1);
        pulls.entry(image.cache_key()).or_default().clone()
    }

    /// Claim a fresh staging directory for a fetch to write into. The
    /// directory itself is left for the fetch to create.
    pub async fn staging(&self) -> io::Result<Staging> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || -> io::Result<Staging> {
            let name = uuid::Uuid::new_v4().simple().to_string();
            let staging = root.join("staging");
            let lock_path = staging.join(format!("{name}.lock"));
            let _store = FileLock::exclusive(&root.join(STORE_LOCK))?;
            let lock = FileLock::try_exclusive(&lock_path)?.ok_or_else(|| {
                io::Error::new(io::ErrorKind::WouldBlock, "staging lock already held")
            })?;
            Ok(Staging {
                path: staging.join(name),
                lock_path,
                _lock: lock,
            })
        })
        .await
        .map_err(io::Error::other)?
    }

    /// Move a fetched tree into the store under its content digest and
    /// record it in the index. The staging directory is released either way.
    pub async fn commit(
        &self,
        image: &ImageRef,
        staging: Staging,
    ) -> io::Result<Arc<ResolvedImage>> {
        let root = self.root.clone();
        let key = image.cache_key();
        let entry_image = image.clone();
        let (resolved, index) = tokio::task::spawn_blocking(move || {
            let stored = store_blob(&root, &entry_image, staging.path());
            if let Err(e) = staging.discard() {
                warn!(error = %e, "Failed to remove staging directory");
            }
            stored
        })
        .await
        .map_err(io::Error::other)??;

        let resolved = Arc::new(resolved);
        let mut images = self.images.write().await;
        images.insert(key, resolved.clone());
        self.merge(&mut images, index);

        debug!(image = %image, digest = %resolved.digest, "Committed image to store");
        Ok(resolved)
    }

    /// All cached images.
    pub async fn list(&self) -> Vec<Arc<ResolvedImage>> {
        let mut images: Vec<_> = self.images.read().await.values().cloned().collect();
        images.sort_by(|a, b| a.reference.cmp(&b.reference));
        images
    }

    /// Number of holders of an image outside the store.
    pub async fn users(&self, image: &ImageRef) -> usize {
        self.images
            .read()
            .await
            .get(&image.cache_key())
            .map_or(0, |r| Arc::strong_count(r) - 1)
    }

    /// Remove an image unless a sandbox or caller still holds it.
    /// Returns whether it was removed.
    pub async fn evict(&self, image: &ImageRef) -> io::Result<bool> {
        let mut images = self.images.write().await;
        self.evict_locked(&mut images, &image.cache_key()).await
    }

    /// Remove every image nobody holds. Returns the evicted references.
    pub async fn prune(&self) -> io::Result<Vec<ImageRef>> {
        let mut images = self.images.write().await;
        let keys: Vec<String> = images.keys().cloned().collect();
        let mut evicted = Vec::new();
        for key in keys {
            let reference = images[&key].reference.clone();
            if self.evict_locked(&mut images, &key).await? {
                evicted.push(reference);
            }
        }
        Ok(evicted)
    }

    async fn evict_locked(
        &self,
        images: &mut HashMap<String, Arc<ResolvedImage>>,
        key: &str,
    ) -> io::Result<bool> {
        let Some(resolved) = images.get(key) else {
            return Ok(false);
        };
        if Arc::strong_count(resolved) > 1 {
            debug!(image = %key, "Image in use, not evicting");
            return Ok(false);
        }
        let Some(resolved) = images.remove(key) else {
            return Ok(false);
        };

        // Digests other local entries still need.
        let local: HashSet<String> = images.values().map(|r| r.digest.clone()).collect();
        let root = self.root.clone();
        let owned_key = key.to_string();
        let digest = resolved.digest.clone();
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let _store = FileLock::exclusive(&root.join(STORE_LOCK))?;
            let mut index = read_index(&root)?;
            index.remove(&owned_key);
            write_index(&root, &index)?;
            let shared = local.contains(&digest) || index.values().any(|e| e.digest == digest);
            if !shared {
                fsutil::remove_tree(&blob_path(&root, &digest))?;
            }
            Ok(())
        })
        .await
        .map_err(io::Error::other)??;

        info!(image = %key, digest = %resolved.digest, "Evicted image");
        Ok(true)
    }

    /// Adopt entries other processes added to the index.
    fn merge(&self, images: &mut HashMap<String, Arc<ResolvedImage>>, index: Index) {
        for (key, entry) in index {
            if images.contains_key(&key) {
                continue;
            }
            if let Some(resolved) = loaded(&self.root, entry) {
                images.insert(key, resolved);
            }
        }
    }
}

/// Hash `staging`, move it to its blob and add the index entry. Returns the
/// resolved image and the index as written.
fn store_blob(
    root: &Path,
    image: &ImageRef,
    staging: &Path,
) -> io::Result<(ResolvedImage, Index)> {
    let digest = fsutil::digest_tree(staging)?;

    let _store = FileLock::exclusive(&root.join(STORE_LOCK))?;
    let blob = blob_path(root, &digest);
    if !blob.exists() {
        std::fs::rename(staging, &blob)?;
    }
    // Otherwise the same content is already stored under another reference.

    let fetched_at = Utc::now();
    let mut index = read_index(root)?;
    index.insert(
        image.cache_key(),
        IndexEntry {
            repository: image.repository.clone(),
            tag: image.tag.clone(),
            digest: digest.clone(),
            fetched_at,
        },
    );
    write_index(root, &index)?;

    let resolved = ResolvedImage {
        reference: image.clone(),
        digest,
        rootfs: blob,
        fetched_at,
    };
    Ok((resolved, index))
}

/// Remove staging directories and lock files whose owner is gone. The
/// caller holds the store lock.
fn clean_staging(staging: &Path) -> io::Result<()> {
    let mut names = HashSet::new();
    for entry in std::fs::read_dir(staging)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        let name = name.strip_suffix(".lock").map(str::to_string).unwrap_or(name);
        names.insert(name);
    }

    for name in names {
        let lock_path = staging.join(format!("{name}.lock"));
        let Some(lock) = FileLock::try_exclusive(&lock_path)? else {
            debug!(staging = %name, "Staging directory in use, keeping it");
            continue;
        };
        fsutil::remove_tree(&staging.join(&name))?;
        fsutil::remove_tree(&lock_path)?;
        drop(lock);
        debug!(staging = %name, "Removed abandoned staging directory");
    }
    Ok(())
}

fn read_index(root: &Path) -> io::Result<Index> {
    match std::fs::read(root.join(INDEX_FILE)) {
        Ok(raw) => serde_json::from_slice(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Index::new()),
        Err(e) => Err(e),
    }
}

/// Replace `index.json` atomically. The caller holds the store lock.
fn write_index(root: &Path, index: &Index) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(index).map_err(io::Error::other)?;
    let tmp = root.join(format!("{INDEX_FILE}.tmp"));
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, root.join(INDEX_FILE))
}

/// The resolved image for an index entry, if its blob exists.
fn loaded(root: &Path, entry: IndexEntry) -> Option<Arc<ResolvedImage>> {
    let rootfs = blob_path(root, &entry.digest);
    if !rootfs.is_dir() {
        return None;
    }
    Some(Arc::new(ResolvedImage {
        reference: ImageRef::new(entry.repository, entry.tag),
        digest: entry.digest,
        rootfs,
        fetched_at: entry.fetched_at,
    }))
}

fn blob_path(root: &Path, digest: &str) -> PathBuf {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    root.join("blobs").join(hex)
}
