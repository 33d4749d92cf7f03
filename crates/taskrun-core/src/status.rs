//! Execution state machine for a single task run.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::CoreError;

/// Lifecycle state of one task execution.
///
/// ```text
/// Pending -> Resolving -> Mounting -> Running -> Finalizing -> Succeeded
///    |           |           |                        |
///    +-----------+-----------+------------------------+-----> Failed
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Runner constructed, `execute` not yet called.
    #[default]
    Pending,
    /// Resolving the image reference.
    Resolving,
    /// Binding volumes and creating the sandbox.
    Mounting,
    /// The command is executing.
    Running,
    /// Persisting caches, capturing outputs, tearing down.
    Finalizing,
    /// Command exited 0 and finalization succeeded.
    Succeeded,
    /// Anything else.
    Failed,
}

impl TaskState {
    /// Returns true if the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether the machine may move from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Resolving)
                | (Pending, Failed)
                | (Resolving, Mounting)
                | (Resolving, Failed)
                | (Mounting, Running)
                | (Mounting, Failed)
                | (Running, Finalizing)
                | (Finalizing, Succeeded)
                | (Finalizing, Failed)
        )
    }

    /// Validate and perform a transition.
    pub fn transition(self, next: TaskState) -> Result<TaskState, CoreError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Resolving => "resolving",
            Self::Mounting => "mounting",
            Self::Running => "running",
            Self::Finalizing => "finalizing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}
