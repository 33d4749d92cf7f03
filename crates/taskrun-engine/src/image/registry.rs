//! Upstream image sources.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use taskrun_core::ImageRef;

use crate::fsutil;

/// Errors a registry can report for a single fetch attempt.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry has no such repository or tag.
    #[error("Image not found in registry: {0}")]
    NotFound(String),

    /// The registry could not be reached or answered with an error.
    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    /// Writing the fetched content failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of image root filesystems.
///
/// Implementations write the unpacked root filesystem of `image` into
/// `dest`, which does not exist yet. A failed fetch may leave `dest`
/// partially written; the caller removes it.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Registry name for logging.
    fn name(&self) -> &str;

    /// Fetch one image into `dest`.
    async fn fetch(&self, image: &ImageRef, dest: &Path) -> Result<(), RegistryError>;
}

/// Registry backed by a directory mirror laid out as
/// `<root>/<repository>/<tag>/` with each tag holding an unpacked rootfs.
#[derive(Debug, Clone)]
pub struct DirectoryRegistry {
    root: PathBuf,
}

impl DirectoryRegistry {
    /// Create a new registry serving from `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Where an image would live in the mirror.
    pub fn image_path(&self, image: &ImageRef) -> PathBuf {
        self.root.join(&image.repository).join(&image.tag)
    }
}

#[async_trait]
impl Registry for DirectoryRegistry {
    fn name(&self) -> &str {
        "directory"
    }

    async fn fetch(&self, image: &ImageRef, dest: &Path) -> Result<(), RegistryError> {
        let src = self.image_path(image);
        debug!(image = %image, src = %src.display(), "Looking up image in mirror");

        let is_dir = tokio::fs::metadata(&src)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(RegistryError::NotFound(image.to_string()));
        }

        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || fsutil::copy_tree(&src, &dest))
            .await
            .map_err(|e| RegistryError::Unavailable(format!("copy task failed: {e}")))??;

        info!(image = %image, registry = %self.root.display(), "Fetched image from mirror");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_copies_tag_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let mirror = tmp.path().join("mirror");
        std::fs::create_dir_all(mirror.join("ci/rust/1.75/etc")).unwrap();
        std::fs::write(mirror.join("ci/rust/1.75/etc/os-release"), "ID=ci").unwrap();

        let registry = DirectoryRegistry::new(&mirror);
        let dest = tmp.path().join("dest");
        registry
            .fetch(&ImageRef::new("ci/rust", "1.75"), &dest)
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(dest.join("etc/os-release")).unwrap(),
            "ID=ci"
        );
    }

    #[tokio::test]
    async fn test_fetch_missing_tag() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = DirectoryRegistry::new(tmp.path());
        let err = registry
            .fetch(&ImageRef::new("nonexistent/image", "bogus"), &tmp.path().join("d"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }
}
