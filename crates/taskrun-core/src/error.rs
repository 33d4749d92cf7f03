//! Core domain errors.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building or validating domain values.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// The task declaration is malformed.
    #[error("Invalid task declaration: {0}")]
    InvalidDeclaration(String),

    /// Two bindings of the same category share a name.
    #[error("Duplicate {kind} name '{name}'")]
    DuplicateName { kind: String, name: String },

    /// YAML parse error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Failed to read a declaration from disk.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a task execution did not succeed.
///
/// `NonZeroExit` and `ProcessTimedOut` mean the task ran and failed. Every
/// other variant except `Cancelled` is an engine fault: the task could not
/// run at all, and the caller owns the retry decision.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    /// Image repository or tag does not match the reference grammar.
    #[error("Invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// The image is not cached and the engine may not pull it.
    #[error("Image not found: {reference}")]
    ImageNotFound { reference: String },

    /// Every pull attempt failed.
    #[error("Failed to pull '{reference}' after {attempts} attempt(s): {reason}")]
    PullFailed {
        reference: String,
        attempts: u32,
        reason: String,
    },

    /// A required input was not materialized before execution.
    #[error("Input '{name}' is missing on the host: {}", .path.display())]
    MissingHostPath { name: String, path: PathBuf },

    /// Two bindings resolve to the same path inside the sandbox.
    #[error("Bindings '{first}' and '{second}' collide at {}", .path.display())]
    PathCollision {
        path: PathBuf,
        first: String,
        second: String,
    },

    /// The sandbox could not be created.
    #[error("Failed to create sandbox: {reason}")]
    SandboxCreateError { reason: String },

    /// The command outlived its deadline and was terminated.
    #[error("Process timed out after {timeout_ms}ms")]
    ProcessTimedOut { timeout_ms: u64 },

    /// Execution was cancelled by the caller.
    #[error("Execution cancelled")]
    Cancelled,

    /// The command exited with a non-zero status.
    #[error("Process exited with code {code}")]
    NonZeroExit { code: i32 },

    /// Caches or outputs could not be copied out of the sandbox.
    #[error("Failed to finalize task: {reason}")]
    FinalizeError { reason: String },

    /// The task spec itself is unusable.
    #[error("Invalid task: {reason}")]
    InvalidTask { reason: String },
}

impl TaskError {
    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidReference { .. } => "invalid_reference",
            Self::ImageNotFound { .. } => "image_not_found",
            Self::PullFailed { .. } => "pull_failed",
            Self::MissingHostPath { .. } => "missing_host_path",
            Self::PathCollision { .. } => "path_collision",
            Self::SandboxCreateError { .. } => "sandbox_create_error",
            Self::ProcessTimedOut { .. } => "process_timed_out",
            Self::Cancelled => "cancelled",
            Self::NonZeroExit { .. } => "non_zero_exit",
            Self::FinalizeError { .. } => "finalize_error",
            Self::InvalidTask { .. } => "invalid_task",
        }
    }

    /// Returns true if the task ran and its command failed.
    pub fn is_task_failure(&self) -> bool {
        matches!(self, Self::NonZeroExit { .. } | Self::ProcessTimedOut { .. })
    }

    /// Returns true if the engine could not carry out the task.
    pub fn is_engine_fault(&self) -> bool {
        !self.is_task_failure() && !matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_zero_exit_is_not_engine_fault() {
        let err = TaskError::NonZeroExit { code: 3 };
        assert!(err.is_task_failure());
        assert!(!err.is_engine_fault());
        assert_eq!(err.to_string(), "Process exited with code 3");
    }

    #[test]
    fn test_pull_failed_is_engine_fault() {
        let err = TaskError::PullFailed {
            reference: "nonexistent/image:bogus".to_string(),
            attempts: 3,
            reason: "not found".to_string(),
        };
        assert!(err.is_engine_fault());
        assert_eq!(err.kind(), "pull_failed");
    }

    #[test]
    fn test_cancelled_is_neither() {
        assert!(!TaskError::Cancelled.is_engine_fault());
        assert!(!TaskError::Cancelled.is_task_failure());
    }

    #[test]
    fn test_serialized_with_kind_tag() {
        let yaml = serde_yaml::to_string(&TaskError::NonZeroExit { code: 3 }).unwrap();
        assert!(yaml.contains("kind: non_zero_exit"));
        assert!(yaml.contains("code: 3"));
    }
}
