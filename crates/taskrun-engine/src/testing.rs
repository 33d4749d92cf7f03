//! Test doubles for the registry and sandbox seams.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use taskrun_core::{ImageRef, Platform, SandboxId};

use crate::image::{Registry, RegistryError, ResolvedImage};
use crate::sandbox::{
    DirectoryBackend, RunCommand, RunControl, RunReport, SandboxBackend, SandboxError,
    SandboxHandle,
};
use crate::volume::{Mount, MountPlan};

/// In-memory registry producing a tiny rootfs per known image.
#[derive(Debug, Default)]
pub struct FakeRegistry {
    images: HashSet<String>,
    failing_first: usize,
    latency: Duration,
    fetches: AtomicUsize,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, repository: &str, tag: &str) -> Self {
        self.images.insert(ImageRef::new(repository, tag).cache_key());
        self
    }

    /// Fail the first `n` fetches as unavailable.
    pub fn failing_first(mut self, n: usize) -> Self {
        self.failing_first = n;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    fn name(&self) -> &str {
        "fake"
    }

    async fn fetch(&self, image: &ImageRef, dest: &Path) -> Result<(), RegistryError> {
        let attempt = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.latency).await;

        if attempt <= self.failing_first {
            // Leave a partial write behind, as a dropped connection would.
            tokio::fs::create_dir_all(dest).await?;
            tokio::fs::write(dest.join("partial"), b"").await?;
            return Err(RegistryError::Unavailable("connection reset".to_string()));
        }
        if !self.images.contains(&image.cache_key()) {
            return Err(RegistryError::NotFound(image.to_string()));
        }

        tokio::fs::create_dir_all(dest.join("etc")).await?;
        tokio::fs::create_dir_all(dest.join("usr/local/cargo/registry")).await?;
        tokio::fs::write(dest.join("etc/os-release"), format!("ID={image}\n")).await?;
        Ok(())
    }
}

/// Directory backend that counts lifecycle calls.
#[derive(Debug)]
pub struct CountingBackend {
    inner: DirectoryBackend,
    creates: AtomicUsize,
    destroys: AtomicUsize,
    fail_create: bool,
    fail_run: bool,
}

impl CountingBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: DirectoryBackend::new(root),
            creates: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
            fail_create: false,
            fail_run: false,
        }
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn failing_run(mut self) -> Self {
        self.fail_run = true;
        self
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    /// Sandboxes currently alive.
    pub fn live(&self) -> usize {
        self.inner.active_sandboxes()
    }
}

#[async_trait]
impl SandboxBackend for CountingBackend {
    fn name(&self) -> &str {
        "counting"
    }

    fn supports(&self, platform: Platform) -> bool {
        self.inner.supports(platform)
    }

    async fn create(
        &self,
        id: SandboxId,
        image: Arc<ResolvedImage>,
        plan: &MountPlan,
    ) -> Result<SandboxHandle, SandboxError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create {
            return Err(SandboxError::io(
                "copy image root filesystem",
                std::io::Error::other("disk full"),
            ));
        }
        self.inner.create(id, image, plan).await
    }

    async fn run(
        &self,
        handle: &SandboxHandle,
        command: &RunCommand,
        control: RunControl,
    ) -> Result<RunReport, SandboxError> {
        if self.fail_run {
            return Err(SandboxError::io(
                "create working directory",
                std::io::Error::other("read-only file system"),
            ));
        }
        self.inner.run(handle, command, control).await
    }

    async fn export(&self, handle: &SandboxHandle, mount: &Mount) -> Result<(), SandboxError> {
        self.inner.export(handle, mount).await
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        self.inner.destroy(handle).await
    }
}
