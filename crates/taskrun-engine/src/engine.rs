//! Engine: the long-lived objects shared by every task execution.

use std::io;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use taskrun_core::TaskSpec;

use crate::config::EngineConfig;
use crate::event::{EventSink, TaskEvent};
use crate::image::{ImageResolver, ImageStore, Registry};
use crate::lock::CacheLocks;
use crate::runner::TaskRunner;
use crate::sandbox::{self, SandboxBackend};

/// Owns the image store, the sandbox backend and the cache locks, and hands
/// out runners that share them.
pub struct Engine {
    config: EngineConfig,
    resolver: Arc<ImageResolver>,
    backend: Arc<dyn SandboxBackend>,
    locks: Arc<CacheLocks>,
}

impl Engine {
    /// Open the image store and select the sandbox backend.
    pub fn new(config: EngineConfig, registry: Arc<dyn Registry>) -> io::Result<Self> {
        let store = Arc::new(ImageStore::open(&config.store_dir)?);
        std::fs::create_dir_all(&config.sandbox_dir)?;

        let resolver = ImageResolver::new(store, registry)
            .with_retry(config.retry.clone())
            .with_offline(config.offline);
        let backend = sandbox::default_backend(&config);
        info!(
            store = %config.store_dir.display(),
            sandboxes = %config.sandbox_dir.display(),
            backend = backend.name(),
            offline = config.offline,
            "Engine ready"
        );

        Ok(Self {
            config,
            resolver: Arc::new(resolver),
            backend,
            locks: Arc::new(CacheLocks::new()),
        })
    }

    /// Builder method to replace the sandbox backend.
    pub fn with_backend(mut self, backend: Arc<dyn SandboxBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<ImageResolver> {
        &self.resolver
    }

    pub fn store(&self) -> &Arc<ImageStore> {
        self.resolver.store()
    }

    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    pub fn locks(&self) -> &Arc<CacheLocks> {
        &self.locks
    }

    /// A bounded channel sized by the configuration.
    pub fn event_channel(&self) -> (EventSink, mpsc::Receiver<TaskEvent>) {
        mpsc::channel(self.config.event_buffer.max(1))
    }

    /// A runner for one execution of `spec`.
    pub fn runner(&self, spec: TaskSpec) -> TaskRunner {
        TaskRunner::new(
            spec,
            self.resolver.clone(),
            self.backend.clone(),
            self.locks.clone(),
        )
        .with_grace_period(self.config.grace_period)
        .with_tail_lines(self.config.output_tail_lines)
    }
}
