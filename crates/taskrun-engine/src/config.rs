//! Engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// How strongly the directory backend isolates the command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Isolation {
    /// Private filesystem tree only.
    #[default]
    Directory,
    /// Additionally enter fresh user, mount and PID namespaces via `unshare`.
    /// Linux only. The process is not rooted at the image copy: absolute
    /// executables and `PATH` lookups still resolve on the host, and the
    /// image is reached through `TASKRUN_SANDBOX_ROOT`.
    Namespaces,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Image store location.
    pub store_dir: PathBuf,

    /// Where sandbox roots are created.
    pub sandbox_dir: PathBuf,

    /// Retry policy for image pulls.
    pub retry: RetryPolicy,

    /// Fail on a cache miss instead of contacting the registry.
    pub offline: bool,

    /// Time between SIGTERM and SIGKILL when stopping a command.
    pub grace_period: Duration,

    /// Lines of stdout/stderr kept for the outcome.
    pub output_tail_lines: usize,

    /// Capacity of the event channel handed to callers.
    pub event_buffer: usize,

    /// Isolation level of the sandbox backend.
    pub isolation: Isolation,
}

impl EngineConfig {
    /// Place the store and sandboxes under one root directory.
    pub fn with_root(mut self, root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        self.store_dir = root.join("images");
        self.sandbox_dir = root.join("sandboxes");
        self
    }

    /// Builder method to set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Builder method to enable offline mode.
    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Builder method to set the termination grace period.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Builder method to set the isolation level.
    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::new(),
            sandbox_dir: PathBuf::new(),
            retry: RetryPolicy::default(),
            offline: false,
            grace_period: Duration::from_secs(10),
            output_tail_lines: 200,
            event_buffer: 1024,
            isolation: Isolation::default(),
        }
        .with_root(std::env::temp_dir().join("taskrun"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_root() {
        let config = EngineConfig::default().with_root("/var/lib/taskrun");
        assert_eq!(config.store_dir, PathBuf::from("/var/lib/taskrun/images"));
        assert_eq!(config.sandbox_dir, PathBuf::from("/var/lib/taskrun/sandboxes"));
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.store_dir.ends_with("taskrun/images"));
        assert_eq!(config.retry.max_attempts, 3);
        assert!(!config.offline);
        assert_eq!(config.isolation, Isolation::Directory);
    }
}
