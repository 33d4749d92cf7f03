//! Directory backend: each sandbox is a private copy of the image rootfs.
//!
//! ```text
//! <root>/<sandbox id>/rootfs/                 copy of the image
//! <root>/<sandbox id>/rootfs/tmp/build/<id>/  build dir with inputs and caches
//! ```
//!
//! Inputs and caches are copied in, outputs start empty. Nothing in the
//! sandbox aliases the host, so concurrent sandboxes never see each
//! other's writes and a read-only input cannot be changed from inside.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use taskrun_core::{BindingKind, Platform, SandboxId};

use super::{
    process, RunCommand, RunControl, RunReport, SandboxBackend, SandboxError, SandboxHandle,
};
use crate::config::Isolation;
use crate::fsutil;
use crate::image::ResolvedImage;
use crate::volume::{Mount, MountPlan};

/// Environment variable pointing at the sandbox root on the host.
pub const ENV_SANDBOX_ROOT: &str = "TASKRUN_SANDBOX_ROOT";

/// Environment variable pointing at the build directory on the host.
pub const ENV_BUILD_DIR: &str = "TASKRUN_BUILD_DIR";

/// Sandboxes as plain directories under a common root.
#[derive(Debug)]
pub struct DirectoryBackend {
    root: PathBuf,
    isolation: Isolation,
    active: AtomicUsize,
}

impl DirectoryBackend {
    /// Create a backend placing sandboxes under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            isolation: Isolation::Directory,
            active: AtomicUsize::new(0),
        }
    }

    /// Builder method to set the isolation level.
    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// Sandboxes created and not yet destroyed.
    pub fn active_sandboxes(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn command(&self, handle: &SandboxHandle, run: &RunCommand, cwd: &Path) -> Command {
        let program = resolve_executable(&run.executable, cwd);

        let mut command = match self.isolation {
            Isolation::Directory => Command::new(&program),
            Isolation::Namespaces => {
                let mut unshare = Command::new("unshare");
                unshare
                    .args([
                        "--user",
                        "--map-root-user",
                        "--mount",
                        "--pid",
                        "--fork",
                        "--kill-child",
                        "--",
                    ])
                    .arg(&program);
                unshare
            }
        };

        command.args(&run.args).current_dir(cwd).env_clear();
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }
        let build_dir = handle.host_path(&handle.build_dir);
        command
            .env("HOME", &build_dir)
            .env(ENV_SANDBOX_ROOT, &handle.root)
            .env(ENV_BUILD_DIR, &build_dir);
        for (key, value) in &run.env {
            command.env(key, value);
        }
        command
    }
}

#[async_trait]
impl SandboxBackend for DirectoryBackend {
    fn name(&self) -> &str {
        match self.isolation {
            Isolation::Directory => "directory",
            Isolation::Namespaces => "directory+namespaces",
        }
    }

    fn supports(&self, platform: Platform) -> bool {
        match self.isolation {
            Isolation::Namespaces => cfg!(target_os = "linux") && platform == Platform::Linux,
            Isolation::Directory => Platform::host() == Some(platform),
        }
    }

    async fn create(
        &self,
        id: SandboxId,
        image: Arc<ResolvedImage>,
        plan: &MountPlan,
    ) -> Result<SandboxHandle, SandboxError> {
        let dir = self.root.join(id.as_str());
        let handle = SandboxHandle::new(id, dir, image, plan);

        let rootfs = handle.image.rootfs.clone();
        let root = handle.root.clone();
        let build_dir = handle.host_path(&handle.build_dir);
        let staged: Vec<(Mount, PathBuf)> = handle
            .mounts
            .iter()
            .map(|m| (m.clone(), handle.host_path(&m.target)))
            .collect();
        let sandbox_dir = handle.dir.clone();

        let result = tokio::task::spawn_blocking(move || -> Result<(), SandboxError> {
            fsutil::copy_tree(&rootfs, &root)
                .map_err(|e| SandboxError::io("copy image root filesystem", e))?;
            std::fs::create_dir_all(&build_dir)
                .map_err(|e| SandboxError::io("create build directory", e))?;
            for (mount, target) in &staged {
                let binding = &mount.binding;
                match binding.kind {
                    BindingKind::Input | BindingKind::Cache => {
                        fsutil::replace_tree(&binding.host_path, target).map_err(|e| {
                            SandboxError::io(format!("stage {} '{}'", binding.kind, binding.name), e)
                        })?
                    }
                    BindingKind::Output => fsutil::reset_dir(target).map_err(|e| {
                        SandboxError::io(format!("prepare output '{}'", binding.name), e)
                    })?,
                }
                debug!(kind = %binding.kind, name = %binding.name, target = %mount.target.display(), "Mounted");
            }
            Ok(())
        })
        .await
        .map_err(|e| SandboxError::io("build sandbox", std::io::Error::other(e)))
        .and_then(|r| r);

        if let Err(e) = result {
            warn!(sandbox = %handle.id, error = %e, "Sandbox creation failed, cleaning up");
            let cleanup = sandbox_dir.clone();
            match tokio::task::spawn_blocking(move || fsutil::remove_tree(&cleanup)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(sandbox = %handle.id, dir = %sandbox_dir.display(), error = %err, "Failed to remove partial sandbox")
                }
                Err(err) => {
                    warn!(sandbox = %handle.id, dir = %sandbox_dir.display(), error = %err, "Partial sandbox cleanup failed")
                }
            }
            return Err(e);
        }

        self.active.fetch_add(1, Ordering::SeqCst);
        info!(
            sandbox = %handle.id,
            image = %handle.image.reference,
            mounts = handle.mounts.len(),
            "Sandbox created"
        );
        Ok(handle)
    }

    async fn run(
        &self,
        handle: &SandboxHandle,
        command: &RunCommand,
        control: RunControl,
    ) -> Result<RunReport, SandboxError> {
        if handle.is_destroyed() {
            return Err(SandboxError::Destroyed(handle.id.clone()));
        }

        let cwd = handle.host_path(&command.working_dir);
        tokio::fs::create_dir_all(&cwd)
            .await
            .map_err(|e| SandboxError::io("create working directory", e))?;

        let child = self.command(handle, command, &cwd);
        debug!(sandbox = %handle.id, command = ?child, "Starting command");
        process::supervise(child, &command.executable, handle, control).await
    }

    async fn export(&self, handle: &SandboxHandle, mount: &Mount) -> Result<(), SandboxError> {
        if handle.is_destroyed() {
            return Err(SandboxError::Destroyed(handle.id.clone()));
        }
        let binding = &mount.binding;
        if binding.kind == BindingKind::Input {
            return Ok(());
        }

        let src = handle.host_path(&mount.target);
        let dst = binding.host_path.clone();
        let context = format!("export {} '{}'", binding.kind, binding.name);
        tokio::task::spawn_blocking(move || {
            if std::fs::symlink_metadata(&src).is_ok() {
                fsutil::replace_tree(&src, &dst)
            } else {
                // Removed by the task: export an empty directory.
                fsutil::reset_dir(&dst)
            }
        })
        .await
        .map_err(|e| SandboxError::io(context.clone(), std::io::Error::other(e)))?
        .map_err(|e| SandboxError::io(context, e))?;

        debug!(sandbox = %handle.id, kind = %binding.kind, name = %binding.name, "Exported");
        Ok(())
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        if !handle.mark_destroyed() {
            debug!(sandbox = %handle.id, "Sandbox already destroyed");
            return Ok(());
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        process::kill_group(handle.process_group());
        handle.set_process_group(None);

        let dir = handle.dir.clone();
        tokio::task::spawn_blocking(move || fsutil::remove_tree(&dir))
            .await
            .map_err(|e| SandboxError::io("remove sandbox", std::io::Error::other(e)))?
            .map_err(|e| SandboxError::io("remove sandbox", e))?;

        info!(sandbox = %handle.id, "Sandbox destroyed");
        Ok(())
    }
}

/// Where to find the program: paths with a separator are taken relative to
/// the working directory, bare names are looked up on `PATH`.
fn resolve_executable(executable: &Path, cwd: &Path) -> PathBuf {
    if executable.is_absolute() || executable.components().count() == 1 {
        executable.to_path_buf()
    } else {
        cwd.join(executable)
    }
}
