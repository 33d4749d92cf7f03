//! Sandbox backends.
//!
//! A sandbox is a private root filesystem built from an image, with the
//! task's inputs and caches staged in and its outputs prepared empty. The
//! command runs against that tree; afterwards caches and outputs are
//! exported back to the host and the sandbox is destroyed.
//!
//! Backends implement [`SandboxBackend`]. The engine picks one with
//! [`default_backend`] unless a caller injects its own.

mod directory;
mod process;

pub use directory::DirectoryBackend;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use taskrun_core::{Platform, SandboxId};

use crate::config::EngineConfig;
use crate::event::EventSink;
use crate::fsutil;
use crate::image::ResolvedImage;
use crate::volume::{Mount, MountPlan};

/// Errors raised by sandbox backends.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("The {backend} backend cannot run {platform} tasks")]
    UnsupportedPlatform {
        backend: String,
        platform: Platform,
    },

    #[error("Failed to {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to start {}: {source}", .executable.display())]
    Spawn {
        executable: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Sandbox {0} was already destroyed")]
    Destroyed(SandboxId),
}

impl SandboxError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// The command to start inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCommand {
    /// Absolute in-sandbox working directory.
    pub working_dir: PathBuf,

    /// Executable as declared by the task.
    pub executable: PathBuf,

    /// Arguments, in order.
    pub args: Vec<String>,

    /// Task parameters, exported as environment variables.
    pub env: Vec<(String, String)>,
}

/// Limits and hooks for one run.
#[derive(Debug, Clone)]
pub struct RunControl {
    /// Wall-clock limit, measured from process start.
    pub timeout: Option<Duration>,

    /// Stops the command when cancelled.
    pub cancel: CancellationToken,

    /// Time between SIGTERM and SIGKILL.
    pub grace: Duration,

    /// Receives output lines as they are written.
    pub events: Option<EventSink>,

    /// Lines of each stream kept in the report.
    pub tail_lines: usize,
}

impl Default for RunControl {
    fn default() -> Self {
        Self {
            timeout: None,
            cancel: CancellationToken::new(),
            grace: Duration::from_secs(10),
            events: None,
            tail_lines: 200,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The process exited by itself. Signal deaths are reported as 128+N.
    Exited(i32),
    /// The timeout elapsed and the process was stopped.
    TimedOut,
    /// Cancellation was requested and the process was stopped.
    Cancelled,
}

/// Result of [`SandboxBackend::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub exit: RunExit,
    pub stdout_tail: Vec<String>,
    pub stderr_tail: Vec<String>,
}

/// A live sandbox. Owned by one runner; destroyed exactly once.
#[derive(Debug)]
pub struct SandboxHandle {
    /// Sandbox identifier.
    pub id: SandboxId,

    /// Host directory holding everything that belongs to this sandbox.
    pub dir: PathBuf,

    /// Host location of the sandbox root filesystem.
    pub root: PathBuf,

    /// Absolute in-sandbox build directory.
    pub build_dir: PathBuf,

    /// Image the root filesystem was built from. Held to pin it in the store.
    pub image: Arc<ResolvedImage>,

    /// Applied mounts, in plan order.
    pub mounts: Vec<Mount>,

    pgid: Mutex<Option<i32>>,
    destroyed: AtomicBool,
}

impl SandboxHandle {
    /// Create a handle for a sandbox whose root filesystem is `dir/rootfs`.
    pub fn new(id: SandboxId, dir: PathBuf, image: Arc<ResolvedImage>, plan: &MountPlan) -> Self {
        Self {
            id,
            root: dir.join("rootfs"),
            dir,
            build_dir: plan.build_dir.clone(),
            image,
            mounts: plan.mounts.clone(),
            pgid: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Host location of an absolute in-sandbox path.
    pub fn host_path(&self, in_sandbox: &Path) -> PathBuf {
        self.root.join(fsutil::strip_root(in_sandbox))
    }

    /// Whether [`SandboxBackend::destroy`] already ran.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Flip to destroyed. Returns false if it already was.
    pub(crate) fn mark_destroyed(&self) -> bool {
        !self.destroyed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn set_process_group(&self, pgid: Option<i32>) {
        *self.pgid.lock().unwrap_or_else(|e| e.into_inner()) = pgid;
    }

    pub(crate) fn process_group(&self) -> Option<i32> {
        *self.pgid.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Something that can build, run and tear down sandboxes.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Whether tasks declared for `platform` can run here.
    fn supports(&self, platform: Platform) -> bool;

    /// Build a sandbox from `image` and apply `plan`. On error nothing is
    /// left behind.
    async fn create(
        &self,
        id: SandboxId,
        image: Arc<ResolvedImage>,
        plan: &MountPlan,
    ) -> Result<SandboxHandle, SandboxError>;

    /// Run a command to completion, timeout or cancellation.
    async fn run(
        &self,
        handle: &SandboxHandle,
        command: &RunCommand,
        control: RunControl,
    ) -> Result<RunReport, SandboxError>;

    /// Copy a cache or output mount back to its host path.
    async fn export(&self, handle: &SandboxHandle, mount: &Mount) -> Result<(), SandboxError>;

    /// Kill anything still running and remove the sandbox. Idempotent.
    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;
}

/// The backend selected by `config`.
pub fn default_backend(config: &EngineConfig) -> Arc<dyn SandboxBackend> {
    Arc::new(DirectoryBackend::new(&config.sandbox_dir).with_isolation(config.isolation))
}
