//! Task specification and volume bindings.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use crate::{CoreError, ImageRef};

/// Operating system family a task must run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Darwin,
    Windows,
}

impl Platform {
    /// The platform of the running host, if it is one of the three.
    pub fn host() -> Option<Platform> {
        if cfg!(target_os = "linux") {
            Some(Self::Linux)
        } else if cfg!(target_os = "macos") {
            Some(Self::Darwin)
        } else if cfg!(target_os = "windows") {
            Some(Self::Windows)
        } else {
            None
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Linux => "linux",
            Self::Darwin => "darwin",
            Self::Windows => "windows",
        };
        f.write_str(s)
    }
}

/// Access mode of a mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MountMode {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "rw")]
    ReadWrite,
}

/// Lifecycle category of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingKind {
    /// Staged read-only from a prior stage.
    Input,
    /// Captured after the run.
    Output,
    /// Persisted across runs, keyed by host path.
    Cache,
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Cache => "cache",
        };
        f.write_str(s)
    }
}

/// A named mount between a host path and a path inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeBinding {
    /// Binding name, unique within its kind.
    pub name: String,

    /// Where the content lives on the host.
    pub host_path: PathBuf,

    /// Where the content appears in the sandbox, relative to the build dir.
    pub container_path: PathBuf,

    /// Access mode inside the sandbox.
    pub mode: MountMode,

    /// Which lifecycle applies.
    pub kind: BindingKind,

    /// A missing host path is skipped instead of failing (inputs only).
    pub optional: bool,
}

impl VolumeBinding {
    /// A read-only input staged from `host_path`.
    pub fn input(
        name: impl Into<String>,
        host_path: impl Into<PathBuf>,
        container_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            host_path: host_path.into(),
            container_path: container_path.into(),
            mode: MountMode::ReadOnly,
            kind: BindingKind::Input,
            optional: false,
        }
    }

    /// A read-write output captured into `host_path` after the run.
    pub fn output(
        name: impl Into<String>,
        host_path: impl Into<PathBuf>,
        container_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            host_path: host_path.into(),
            container_path: container_path.into(),
            mode: MountMode::ReadWrite,
            kind: BindingKind::Output,
            optional: false,
        }
    }

    /// A read-write cache persisted at `host_path`. Named by its container path.
    pub fn cache(host_path: impl Into<PathBuf>, container_path: impl Into<PathBuf>) -> Self {
        let container_path = container_path.into();
        Self {
            name: container_path.display().to_string(),
            host_path: host_path.into(),
            container_path,
            mode: MountMode::ReadWrite,
            kind: BindingKind::Cache,
            optional: false,
        }
    }

    /// Builder method to mark the binding optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// The command to execute, treated as an opaque black box.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpec {
    /// Working directory, relative to the sandbox build dir.
    pub working_dir: PathBuf,

    /// Executable to start.
    pub executable: PathBuf,

    /// Arguments, in order.
    pub args: Vec<String>,
}

impl RunSpec {
    /// Create a new RunSpec running in the build dir itself.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: PathBuf::new(),
            executable: executable.into(),
            args: Vec::new(),
        }
    }

    /// Builder method to set the working directory.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Builder method to append an argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Everything needed to execute one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Platform the task must run on.
    pub platform: Platform,

    /// Image providing the root filesystem.
    pub image: ImageRef,

    /// Read-only inputs.
    pub inputs: Vec<VolumeBinding>,

    /// Persistent caches.
    pub caches: Vec<VolumeBinding>,

    /// Captured outputs.
    pub outputs: Vec<VolumeBinding>,

    /// Environment passed to the command, in declaration order.
    pub params: Vec<(String, String)>,

    /// The command.
    pub run: RunSpec,
}

impl TaskSpec {
    /// Create a new TaskSpec with no bindings.
    pub fn new(platform: Platform, image: ImageRef, run: RunSpec) -> Self {
        Self {
            platform,
            image,
            inputs: Vec::new(),
            caches: Vec::new(),
            outputs: Vec::new(),
            params: Vec::new(),
            run,
        }
    }

    /// Builder method to add an input.
    pub fn with_input(mut self, binding: VolumeBinding) -> Self {
        self.inputs.push(binding);
        self
    }

    /// Builder method to add a cache.
    pub fn with_cache(mut self, binding: VolumeBinding) -> Self {
        self.caches.push(binding);
        self
    }

    /// Builder method to add an output.
    pub fn with_output(mut self, binding: VolumeBinding) -> Self {
        self.outputs.push(binding);
        self
    }

    /// Builder method to add an environment variable.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// All bindings: inputs, then caches, then outputs.
    pub fn bindings(&self) -> impl Iterator<Item = &VolumeBinding> {
        self.inputs
            .iter()
            .chain(self.caches.iter())
            .chain(self.outputs.iter())
    }

    /// Check that names are unique within each category.
    pub fn validate(&self) -> Result<(), CoreError> {
        for group in [&self.inputs, &self.caches, &self.outputs] {
            let mut seen = HashSet::new();
            for binding in group {
                if !seen.insert(binding.name.as_str()) {
                    return Err(CoreError::DuplicateName {
                        kind: binding.kind.to_string(),
                        name: binding.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> TaskSpec {
        TaskSpec::new(
            Platform::Linux,
            ImageRef::new("rust", "latest"),
            RunSpec::new("sh").with_arg("-c").with_arg("true"),
        )
    }

    #[test]
    fn test_bindings_order() {
        let spec = spec()
            .with_output(VolumeBinding::output("out", "/h/out", "out"))
            .with_cache(VolumeBinding::cache("/h/cache", "repo/target"))
            .with_input(VolumeBinding::input("repo", "/h/repo", "repo"));

        let kinds: Vec<_> = spec.bindings().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![BindingKind::Input, BindingKind::Cache, BindingKind::Output]
        );
    }

    #[test]
    fn test_duplicate_names_rejected_within_kind() {
        let spec = spec()
            .with_input(VolumeBinding::input("repo", "/a", "a"))
            .with_input(VolumeBinding::input("repo", "/b", "b"));
        let err = spec.validate().unwrap_err();
        assert!(matches!(err, CoreError::DuplicateName { ref kind, .. } if kind == "input"));
    }

    #[test]
    fn test_same_name_allowed_across_kinds() {
        let spec = spec()
            .with_input(VolumeBinding::input("build", "/a", "in"))
            .with_output(VolumeBinding::output("build", "/b", "out"));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_cache_named_by_path() {
        let cache = VolumeBinding::cache("/h/c", "repo/target");
        assert_eq!(cache.name, "repo/target");
        assert_eq!(cache.mode, MountMode::ReadWrite);
    }

    #[test]
    fn test_platform_serde() {
        let p: Platform = serde_yaml::from_str("darwin").unwrap();
        assert_eq!(p, Platform::Darwin);
        assert_eq!(p.to_string(), "darwin");
    }
}
