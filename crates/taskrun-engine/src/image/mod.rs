//! Image resolution: reference validation, local cache, deduplicated pulls.

mod registry;
mod store;

pub use registry::{DirectoryRegistry, Registry, RegistryError};
pub use store::{ImageStore, Staging};

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use taskrun_core::{ImageRef, TaskError};

use crate::retry::RetryPolicy;

/// A content-addressed, immutable root filesystem.
///
/// Shared between sandboxes through `Arc`; the strong count is the number
/// of live users and gates eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    /// Reference this image was resolved from.
    pub reference: ImageRef,

    /// `sha256:<hex>` of the root filesystem.
    pub digest: String,

    /// Location of the root filesystem in the store. Never written to.
    pub rootfs: PathBuf,

    /// When the image entered the store.
    pub fetched_at: DateTime<Utc>,
}

/// Resolves image references to root filesystems.
pub struct ImageResolver {
    store: Arc<ImageStore>,
    registry: Arc<dyn Registry>,
    retry: RetryPolicy,
    offline: bool,
}

impl ImageResolver {
    /// Create a resolver over an injected store and registry.
    pub fn new(store: Arc<ImageStore>, registry: Arc<dyn Registry>) -> Self {
        Self {
            store,
            registry,
            retry: RetryPolicy::default(),
            offline: false,
        }
    }

    /// Builder method to set the pull retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Builder method to forbid registry access.
    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<ImageStore> {
        &self.store
    }

    /// Resolve a reference, pulling it if it is not cached.
    ///
    /// Concurrent calls for the same reference share one pull: late callers
    /// wait on the pull lock and then find the image in the store.
    pub async fn resolve(&self, image: &ImageRef) -> Result<Arc<ResolvedImage>, TaskError> {
        image.validate()?;

        if let Some(hit) = self.store.lookup(image).await {
            debug!(image = %image, digest = %hit.digest, "Image cache hit");
            return Ok(hit);
        }

        let lock = self.store.pull_lock(image);
        let _pull = lock.lock().await;

        // Someone else may have finished the pull while we waited.
        if let Some(hit) = self.store.lookup(image).await {
            debug!(image = %image, digest = %hit.digest, "Image pulled by concurrent resolver");
            return Ok(hit);
        }

        if self.offline {
            return Err(TaskError::ImageNotFound {
                reference: image.to_string(),
            });
        }

        self.pull(image).await
    }

    async fn pull(&self, image: &ImageRef) -> Result<Arc<ResolvedImage>, TaskError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let staging = self.store.staging().await.map_err(|e| TaskError::PullFailed {
                reference: image.to_string(),
                attempts,
                reason: format!("cannot create staging directory: {e}"),
            })?;
            info!(
                image = %image,
                registry = self.registry.name(),
                attempt = attempts,
                "Pulling image"
            );

            let fetched = self.registry.fetch(image, staging.path()).await;
            let reason = match fetched {
                Ok(()) => match self.store.commit(image, staging).await {
                    Ok(resolved) => {
                        info!(image = %image, digest = %resolved.digest, "Image pulled");
                        return Ok(resolved);
                    }
                    Err(e) => format!("failed to store image: {e}"),
                },
                Err(e) => {
                    match tokio::task::spawn_blocking(move || staging.discard()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            warn!(image = %image, error = %err, "Failed to remove partial pull")
                        }
                        Err(err) => warn!(image = %image, error = %err, "Partial pull cleanup failed"),
                    }
                    e.to_string()
                }
            };

            if !self.retry.should_retry(attempts) {
                warn!(image = %image, attempts, reason = %reason, "Giving up on image pull");
                return Err(TaskError::PullFailed {
                    reference: image.to_string(),
                    attempts,
                    reason,
                });
            }

            let delay = self.retry.delay_after(attempts);
            warn!(
                image = %image,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "Image pull failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRegistry;
    use std::time::Duration;

    fn resolver(tmp: &std::path::Path, registry: Arc<FakeRegistry>) -> ImageResolver {
        let store = Arc::new(ImageStore::open(tmp.join("store")).unwrap());
        ImageResolver::new(store, registry)
            .with_retry(RetryPolicy::new(3, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_second_resolve_hits_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(FakeRegistry::new().with_image("rust", "latest"));
        let resolver = resolver(tmp.path(), registry.clone());
        let image = ImageRef::new("rust", "latest");

        let first = resolver.resolve(&image).await.unwrap();
        let second = resolver.resolve(&image).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.fetches(), 1);
    }

    #[tokio::test]
    async fn test_invalid_reference_never_hits_registry() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(FakeRegistry::new());
        let resolver = resolver(tmp.path(), registry.clone());

        let err = resolver
            .resolve(&ImageRef::new("Bad Repo", "latest"))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidReference { .. }));
        assert_eq!(registry.fetches(), 0);
    }

    #[tokio::test]
    async fn test_unknown_image_exhausts_retry_budget() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(FakeRegistry::new());
        let resolver = resolver(tmp.path(), registry.clone());

        let err = resolver
            .resolve(&ImageRef::new("nonexistent/image", "bogus"))
            .await
            .unwrap_err();
        match err {
            TaskError::PullFailed { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected PullFailed, got {other:?}"),
        }
        assert_eq!(registry.fetches(), 3);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            FakeRegistry::new()
                .with_image("rust", "latest")
                .failing_first(2),
        );
        let resolver = resolver(tmp.path(), registry.clone());

        let resolved = resolver.resolve(&ImageRef::new("rust", "latest")).await.unwrap();
        assert!(resolved.rootfs.exists());
        assert_eq!(registry.fetches(), 3);
        // Failed attempts leave nothing behind in staging.
        let staging = tmp.path().join("store/staging");
        assert_eq!(std::fs::read_dir(staging).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_offline_miss_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(FakeRegistry::new().with_image("rust", "latest"));
        let resolver = resolver(tmp.path(), registry.clone()).with_offline(true);

        let err = resolver
            .resolve(&ImageRef::new("rust", "latest"))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::ImageNotFound { .. }));
        assert_eq!(registry.fetches(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_pull() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            FakeRegistry::new()
                .with_image("rust", "latest")
                .with_latency(Duration::from_millis(50)),
        );
        let resolver = Arc::new(resolver(tmp.path(), registry.clone()));
        let image = ImageRef::new("rust", "latest");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let resolver = resolver.clone();
                let image = image.clone();
                tokio::spawn(async move { resolver.resolve(&image).await })
            })
            .collect();

        let mut digests = Vec::new();
        for handle in handles {
            digests.push(handle.await.unwrap().unwrap().digest.clone());
        }
        assert_eq!(registry.fetches(), 1);
        digests.dedup();
        assert_eq!(digests.len(), 1);
    }
}
