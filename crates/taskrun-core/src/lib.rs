//! TaskRun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Async runtimes
//! - Processes or sandboxes
//! - Image registries
//!
//! All types here describe a single task execution: what to run, what to
//! mount, and how it ended.

pub mod declaration;
pub mod error;
pub mod ids;
pub mod image;
pub mod outcome;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use declaration::{TaskDeclaration, Workspace};
pub use error::{CoreError, TaskError};
pub use ids::{ExecutionId, SandboxId};
pub use image::ImageRef;
pub use outcome::TaskOutcome;
pub use status::TaskState;
pub use task::{BindingKind, MountMode, Platform, RunSpec, TaskSpec, VolumeBinding};
