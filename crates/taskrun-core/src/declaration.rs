//! Task declaration file format.
//!
//! A declaration is the boundary artifact handed over by the pipeline:
//!
//! ```yaml
//! platform: linux
//! image_resource:
//!   type: registry-image
//!   source: { repository: rust, tag: latest }
//! inputs:
//!   - name: repo
//! caches:
//!   - path: repo/target
//!   - path: ../../../usr/local/cargo/registry
//! outputs:
//!   - name: dist
//!     path: repo/dist
//! run:
//!   dir: repo
//!   path: sh
//!   args: [-exc, "cargo test && cargo build --release"]
//! ```
//!
//! Declarations only name things. Turning names into host paths is the job of
//! a [`Workspace`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::image::DEFAULT_TAG;
use crate::{CoreError, ImageRef, Platform, RunSpec, TaskSpec, VolumeBinding};

/// Image resource types the engine knows how to resolve.
pub const SUPPORTED_IMAGE_TYPES: &[&str] = &["registry-image", "docker-image"];

/// Parsed task declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDeclaration {
    pub platform: Platform,
    pub image_resource: ImageResource,
    #[serde(default)]
    pub inputs: Vec<InputDeclaration>,
    #[serde(default)]
    pub caches: Vec<CacheDeclaration>,
    #[serde(default)]
    pub outputs: Vec<OutputDeclaration>,
    /// Environment for the command, in declaration order.
    #[serde(default)]
    pub params: serde_yaml::Mapping,
    pub run: RunDeclaration,
}

/// `image_resource` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageResource {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: ImageSource,
}

/// `image_resource.source` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageSource {
    pub repository: String,
    #[serde(default = "default_tag")]
    pub tag: String,
}

fn default_tag() -> String {
    DEFAULT_TAG.to_string()
}

/// One entry of `inputs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputDeclaration {
    pub name: String,
    /// Mount path; defaults to the name.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

/// One entry of `caches`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheDeclaration {
    pub path: String,
}

/// One entry of `outputs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputDeclaration {
    pub name: String,
    /// Mount path; defaults to the name.
    #[serde(default)]
    pub path: Option<String>,
}

/// `run` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunDeclaration {
    #[serde(default)]
    pub dir: Option<String>,
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl TaskDeclaration {
    /// Parse a declaration from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        let declaration: Self = serde_yaml::from_str(yaml)?;
        declaration.validate()?;
        Ok(declaration)
    }

    /// Read and parse a declaration file.
    pub fn from_path(path: &Path) -> Result<Self, CoreError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    /// Structural checks that serde cannot express.
    pub fn validate(&self) -> Result<(), CoreError> {
        if !SUPPORTED_IMAGE_TYPES.contains(&self.image_resource.kind.as_str()) {
            return Err(CoreError::InvalidDeclaration(format!(
                "unsupported image_resource type '{}' (expected one of: {})",
                self.image_resource.kind,
                SUPPORTED_IMAGE_TYPES.join(", ")
            )));
        }
        if self.run.path.trim().is_empty() {
            return Err(CoreError::InvalidDeclaration("run.path is empty".to_string()));
        }
        if let Some(input) = self.inputs.iter().find(|i| i.name.is_empty()) {
            return Err(CoreError::InvalidDeclaration(format!(
                "input with path {:?} has an empty name",
                input.path
            )));
        }
        if self.outputs.iter().any(|o| o.name.is_empty()) {
            return Err(CoreError::InvalidDeclaration(
                "output with an empty name".to_string(),
            ));
        }
        if self.caches.iter().any(|c| c.path.trim().is_empty()) {
            return Err(CoreError::InvalidDeclaration(
                "cache with an empty path".to_string(),
            ));
        }
        Ok(())
    }

    /// The image reference named by `image_resource.source`.
    pub fn image(&self) -> ImageRef {
        ImageRef::new(
            &self.image_resource.source.repository,
            &self.image_resource.source.tag,
        )
    }

    /// Bind every declared name to a host path and build the TaskSpec.
    pub fn into_spec(self, workspace: &Workspace) -> Result<TaskSpec, CoreError> {
        let image = self.image();
        let mut run = RunSpec::new(&self.run.path);
        if let Some(dir) = &self.run.dir {
            run = run.with_dir(dir);
        }
        run.args = self.run.args;

        let mut spec = TaskSpec::new(self.platform, image, run);

        for input in self.inputs {
            let container = input.path.clone().unwrap_or_else(|| input.name.clone());
            let mut binding =
                VolumeBinding::input(&input.name, workspace.input_host_path(&input.name), container);
            if input.optional {
                binding = binding.optional();
            }
            spec = spec.with_input(binding);
        }
        for cache in self.caches {
            spec = spec.with_cache(VolumeBinding::cache(
                workspace.cache_host_path(&cache.path),
                &cache.path,
            ));
        }
        for output in self.outputs {
            let container = output.path.clone().unwrap_or_else(|| output.name.clone());
            spec = spec.with_output(VolumeBinding::output(
                &output.name,
                workspace.output_host_path(&output.name),
                container,
            ));
        }
        for (key, value) in self.params {
            let serde_yaml::Value::String(key) = key else {
                return Err(CoreError::InvalidDeclaration(format!(
                    "param name {key:?} must be a string"
                )));
            };
            spec = spec.with_param(&key, param_to_string(&key, value)?);
        }

        spec.validate()?;
        Ok(spec)
    }
}

fn param_to_string(key: &str, value: serde_yaml::Value) -> Result<String, CoreError> {
    use serde_yaml::Value;
    match value {
        Value::Null => Ok(String::new()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(s),
        _ => Err(CoreError::InvalidDeclaration(format!(
            "param '{key}' must be a scalar"
        ))),
    }
}

/// Host-side layout that gives declared names a place on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// Inputs default to `<inputs_dir>/<name>`.
    pub inputs_dir: PathBuf,

    /// Outputs land in `<outputs_dir>/<name>`.
    pub outputs_dir: PathBuf,

    /// Caches persist under `<cache_dir>/<task_key>/`.
    pub cache_dir: PathBuf,

    /// Distinguishes caches of different tasks sharing a cache dir.
    pub task_key: String,

    /// Explicit host paths for particular inputs.
    pub input_overrides: HashMap<String, PathBuf>,
}

impl Workspace {
    /// Create a Workspace rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>, task_key: impl AsRef<str>) -> Self {
        let base_dir = base_dir.into();
        Self {
            inputs_dir: base_dir.clone(),
            outputs_dir: base_dir.clone(),
            cache_dir: base_dir.join(".taskrun-cache"),
            task_key: sanitize_key(task_key.as_ref()),
            input_overrides: HashMap::new(),
        }
    }

    /// Builder method to set the outputs directory.
    pub fn with_outputs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.outputs_dir = dir.into();
        self
    }

    /// Builder method to set the cache directory.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Builder method to point one input at an explicit host path.
    pub fn with_input(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.input_overrides.insert(name.into(), path.into());
        self
    }

    /// Host path of an input.
    pub fn input_host_path(&self, name: &str) -> PathBuf {
        self.input_overrides
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.inputs_dir.join(name))
    }

    /// Host path of an output.
    pub fn output_host_path(&self, name: &str) -> PathBuf {
        self.outputs_dir.join(name)
    }

    /// Host path of a cache: keyed by task and by the declared path, so the
    /// same declaration always lands on the same directory.
    pub fn cache_host_path(&self, container_path: &str) -> PathBuf {
        let normalized = container_path.trim_start_matches("./").trim_end_matches('/');
        let digest = Sha256::digest(normalized.as_bytes());
        self.cache_dir
            .join(&self.task_key)
            .join(&hex::encode(digest)[..16])
    }
}

fn sanitize_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BindingKind, MountMode};

    const CI_TASK: &str = r#"
platform: linux
image_resource:
  type: registry-image
  source:
    repository: rust
    tag: "1.75"
inputs:
  - name: repo
caches:
  - path: repo/target
  - path: ../../../usr/local/cargo/registry
outputs:
  - name: dist
    path: repo/dist
run:
  dir: repo
  path: sh
  args:
    - -exc
    - |
      cargo fmt --check
      cargo test
      cargo build --release
"#;

    #[test]
    fn test_parse_ci_task() {
        let decl = TaskDeclaration::from_yaml(CI_TASK).unwrap();
        assert_eq!(decl.platform, Platform::Linux);
        assert_eq!(decl.image(), ImageRef::new("rust", "1.75"));
        assert_eq!(decl.inputs.len(), 1);
        assert_eq!(decl.caches.len(), 2);
        assert_eq!(decl.run.dir.as_deref(), Some("repo"));
        assert_eq!(decl.run.args[0], "-exc");
    }

    #[test]
    fn test_into_spec_binds_host_paths() {
        let workspace = Workspace::new("/work", "ci/test")
            .with_outputs_dir("/out")
            .with_cache_dir("/cache")
            .with_input("repo", "/checkout");
        let spec = TaskDeclaration::from_yaml(CI_TASK)
            .unwrap()
            .into_spec(&workspace)
            .unwrap();

        let repo = &spec.inputs[0];
        assert_eq!(repo.host_path, PathBuf::from("/checkout"));
        assert_eq!(repo.container_path, PathBuf::from("repo"));
        assert_eq!(repo.mode, MountMode::ReadOnly);

        let dist = &spec.outputs[0];
        assert_eq!(dist.host_path, PathBuf::from("/out/dist"));
        assert_eq!(dist.container_path, PathBuf::from("repo/dist"));

        assert!(spec.caches.iter().all(|c| c.kind == BindingKind::Cache));
        assert!(spec.caches[0].host_path.starts_with("/cache/ci_test"));
        assert_ne!(spec.caches[0].host_path, spec.caches[1].host_path);
        assert_eq!(spec.run.working_dir, PathBuf::from("repo"));
    }

    #[test]
    fn test_cache_host_path_is_stable() {
        let workspace = Workspace::new("/work", "build");
        assert_eq!(
            workspace.cache_host_path("repo/target"),
            workspace.cache_host_path("./repo/target/")
        );
    }

    #[test]
    fn test_tag_defaults_to_latest() {
        let yaml = r#"
platform: linux
image_resource: { type: registry-image, source: { repository: alpine } }
run: { path: "true" }
"#;
        let decl = TaskDeclaration::from_yaml(yaml).unwrap();
        assert_eq!(decl.image().tag, "latest");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = r#"
platform: linux
image_resource: { type: registry-image, source: { repository: alpine } }
run: { path: "true" }
container_limits: { cpu: 2 }
"#;
        assert!(matches!(
            TaskDeclaration::from_yaml(yaml),
            Err(CoreError::Yaml(_))
        ));
    }

    #[test]
    fn test_unsupported_image_type() {
        let yaml = r#"
platform: linux
image_resource: { type: git, source: { repository: alpine } }
run: { path: "true" }
"#;
        assert!(matches!(
            TaskDeclaration::from_yaml(yaml),
            Err(CoreError::InvalidDeclaration(_))
        ));
    }

    #[test]
    fn test_params_become_strings() {
        let yaml = r#"
platform: linux
image_resource: { type: registry-image, source: { repository: alpine } }
params:
  RUST_BACKTRACE: 1
  CARGO_TERM_COLOR: always
  VERBOSE: true
run: { path: env }
"#;
        let spec = TaskDeclaration::from_yaml(yaml)
            .unwrap()
            .into_spec(&Workspace::new("/w", "t"))
            .unwrap();
        assert_eq!(
            spec.params,
            vec![
                ("RUST_BACKTRACE".to_string(), "1".to_string()),
                ("CARGO_TERM_COLOR".to_string(), "always".to_string()),
                ("VERBOSE".to_string(), "true".to_string()),
            ]
        );
    }

    #[test]
    fn test_params_keep_declaration_order() {
        let yaml = r#"
platform: linux
image_resource: { type: registry-image, source: { repository: alpine } }
params:
  ZED: 1
  ALPHA: 2
run: { path: env }
"#;
        let spec = TaskDeclaration::from_yaml(yaml)
            .unwrap()
            .into_spec(&Workspace::new("/w", "t"))
            .unwrap();
        let keys: Vec<&str> = spec.params.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["ZED", "ALPHA"]);
    }

    #[test]
    fn test_param_names_must_be_strings() {
        let yaml = r#"
platform: linux
image_resource: { type: registry-image, source: { repository: alpine } }
params:
  1: one
run: { path: env }
"#;
        let err = TaskDeclaration::from_yaml(yaml)
            .unwrap()
            .into_spec(&Workspace::new("/w", "t"))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidDeclaration(_)));
    }

    #[test]
    fn test_duplicate_output_names() {
        let yaml = r#"
platform: linux
image_resource: { type: registry-image, source: { repository: alpine } }
outputs:
  - name: dist
  - name: dist
    path: other
run: { path: "true" }
"#;
        let err = TaskDeclaration::from_yaml(yaml)
            .unwrap()
            .into_spec(&Workspace::new("/w", "t"))
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateName { .. }));
    }
}
