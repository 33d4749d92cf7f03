//! Volume binding: turns declared bindings into an ordered mount plan.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use taskrun_core::{BindingKind, SandboxId, TaskError, VolumeBinding};

/// Parent of every build directory inside a sandbox.
pub const BUILD_ROOT: &str = "/tmp/build";

/// One binding placed at an absolute path inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// The declared binding.
    pub binding: VolumeBinding,

    /// Absolute, normalized path inside the sandbox.
    pub target: PathBuf,
}

/// Mounts in the order they must be applied: parents before children, so a
/// nested binding overlays the one containing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPlan {
    /// Absolute build directory inside the sandbox.
    pub build_dir: PathBuf,

    /// Ordered mounts.
    pub mounts: Vec<Mount>,
}

impl MountPlan {
    /// Mounts of one kind, in plan order.
    pub fn of_kind(&self, kind: BindingKind) -> impl Iterator<Item = &Mount> {
        self.mounts.iter().filter(move |m| m.binding.kind == kind)
    }

    /// Host paths of every cache in the plan.
    pub fn cache_host_paths(&self) -> Vec<PathBuf> {
        self.of_kind(BindingKind::Cache)
            .map(|m| m.binding.host_path.clone())
            .collect()
    }

    /// Absolute in-sandbox path for a path relative to the build dir.
    pub fn resolve(&self, container_path: &Path) -> PathBuf {
        resolve_in_sandbox(&self.build_dir, container_path)
    }
}

/// Computes mount plans for one sandbox.
#[derive(Debug, Clone)]
pub struct VolumeSet {
    build_dir: PathBuf,
}

impl VolumeSet {
    /// Build directory for a sandbox: `/tmp/build/<short id>`.
    pub fn for_sandbox(id: &SandboxId) -> Self {
        Self {
            build_dir: Path::new(BUILD_ROOT).join(id.short()),
        }
    }

    /// Use an explicit absolute build directory.
    pub fn with_build_dir(build_dir: impl Into<PathBuf>) -> Self {
        Self {
            build_dir: build_dir.into(),
        }
    }

    /// Validate bindings and compute the plan.
    ///
    /// All checks that can fail run before anything touches the host, so a
    /// collision leaves no trace. Only then are missing cache directories
    /// created empty.
    pub fn bind<'a, I>(&self, bindings: I) -> Result<MountPlan, TaskError>
    where
        I: IntoIterator<Item = &'a VolumeBinding>,
    {
        let mut mounts = Vec::new();
        let mut claimed: HashMap<PathBuf, String> = HashMap::new();

        for binding in bindings {
            let target = resolve_in_sandbox(&self.build_dir, &binding.container_path);
            if target.parent().is_none() {
                return Err(TaskError::InvalidTask {
                    reason: format!("'{}' would be mounted over the sandbox root", binding.name),
                });
            }
            let label = format!("{}:{}", binding.kind, binding.name);
            if let Some(first) = claimed.insert(target.clone(), label.clone()) {
                return Err(TaskError::PathCollision {
                    path: target,
                    first,
                    second: label,
                });
            }
            mounts.push(Mount {
                binding: binding.clone(),
                target,
            });
        }

        let mut missing = None;
        mounts.retain(|mount| {
            let binding = &mount.binding;
            if binding.kind != BindingKind::Input || binding.host_path.exists() {
                return true;
            }
            if binding.optional {
                debug!(input = %binding.name, "Optional input missing, skipping");
                return false;
            }
            missing.get_or_insert_with(|| TaskError::MissingHostPath {
                name: binding.name.clone(),
                path: binding.host_path.clone(),
            });
            true
        });
        if let Some(err) = missing {
            return Err(err);
        }

        for mount in mounts.iter().filter(|m| m.binding.kind == BindingKind::Cache) {
            if !mount.binding.host_path.exists() {
                std::fs::create_dir_all(&mount.binding.host_path).map_err(|e| {
                    TaskError::SandboxCreateError {
                        reason: format!(
                            "cannot create cache directory {}: {e}",
                            mount.binding.host_path.display()
                        ),
                    }
                })?;
                info!(cache = %mount.binding.name, path = %mount.binding.host_path.display(), "Created cold cache");
            }
        }

        // Stable: equal depths keep declaration order.
        mounts.sort_by_key(|m| m.target.components().count());

        Ok(MountPlan {
            build_dir: self.build_dir.clone(),
            mounts,
        })
    }
}

/// Resolve `path` against `base` lexically, the way a chrooted process
/// would: `..` at the root stays at the root.
pub fn resolve_in_sandbox(base: &Path, path: &Path) -> PathBuf {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    let start = if path.has_root() { Path::new("/") } else { base };

    for component in start.components().chain(path.components()) {
        match component {
            Component::RootDir | Component::Prefix(_) => parts.clear(),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(name) => parts.push(name),
        }
    }

    let mut resolved = PathBuf::from("/");
    resolved.extend(parts);
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> VolumeSet {
        VolumeSet::with_build_dir("/tmp/build/abcd1234")
    }

    #[test]
    fn test_resolve_relative() {
        let base = Path::new("/tmp/build/abcd1234");
        assert_eq!(
            resolve_in_sandbox(base, Path::new("repo/./target")),
            PathBuf::from("/tmp/build/abcd1234/repo/target")
        );
    }

    #[test]
    fn test_resolve_escaping_cache_path() {
        let base = Path::new("/tmp/build/abcd1234");
        assert_eq!(
            resolve_in_sandbox(base, Path::new("../../../usr/local/cargo/registry")),
            PathBuf::from("/usr/local/cargo/registry")
        );
        assert_eq!(
            resolve_in_sandbox(base, Path::new("../../../../../../etc")),
            PathBuf::from("/etc")
        );
    }

    #[test]
    fn test_output_collision_detected_before_side_effects() {
        let tmp = tempfile::tempdir().unwrap();
        let cache_host = tmp.path().join("cache");
        let bindings = vec![
            VolumeBinding::cache(&cache_host, "cache"),
            VolumeBinding::output("a", tmp.path().join("a"), "dist"),
            VolumeBinding::output("b", tmp.path().join("b"), "./dist/"),
        ];

        let err = set().bind(&bindings).unwrap_err();
        match err {
            TaskError::PathCollision { first, second, path } => {
                assert_eq!(first, "output:a");
                assert_eq!(second, "output:b");
                assert_eq!(path, PathBuf::from("/tmp/build/abcd1234/dist"));
            }
            other => panic!("expected PathCollision, got {other:?}"),
        }
        assert!(!cache_host.exists());
    }

    #[test]
    fn test_missing_input() {
        let tmp = tempfile::tempdir().unwrap();
        let bindings = vec![VolumeBinding::input("repo", tmp.path().join("repo"), "repo")];
        let err = set().bind(&bindings).unwrap_err();
        assert!(matches!(err, TaskError::MissingHostPath { ref name, .. } if name == "repo"));
    }

    #[test]
    fn test_optional_missing_input_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let bindings =
            vec![VolumeBinding::input("extra", tmp.path().join("extra"), "extra").optional()];
        let plan = set().bind(&bindings).unwrap();
        assert!(plan.mounts.is_empty());
    }

    #[test]
    fn test_cold_cache_created() {
        let tmp = tempfile::tempdir().unwrap();
        let host = tmp.path().join("caches/x");
        let plan = set().bind(&[VolumeBinding::cache(&host, "cache")]).unwrap();
        assert!(host.is_dir());
        assert_eq!(plan.cache_host_paths(), vec![host]);
    }

    #[test]
    fn test_nested_mounts_ordered_parent_first() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        let bindings = vec![
            VolumeBinding::cache(tmp.path().join("target"), "repo/target"),
            VolumeBinding::input("repo", &repo, "repo"),
        ];
        let plan = set().bind(bindings.iter()).unwrap();
        let names: Vec<_> = plan.mounts.iter().map(|m| m.binding.name.as_str()).collect();
        assert_eq!(names, vec!["repo", "repo/target"]);
    }

    #[test]
    fn test_mount_over_root_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = set()
            .bind(&[VolumeBinding::cache(tmp.path(), "../../../..")])
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidTask { .. }));
    }
}
