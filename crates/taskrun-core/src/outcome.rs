//! Terminal result of one task execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::{ExecutionId, TaskError, TaskState};

/// Outcome of a task execution. Produced once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Execution this outcome belongs to.
    pub execution_id: ExecutionId,

    /// Terminal state (`Succeeded` or `Failed`).
    pub state: TaskState,

    /// Exit code of the command, if it ran to completion.
    pub exit_code: Option<i32>,

    /// True iff the command exited 0 and finalization succeeded.
    pub succeeded: bool,

    /// Host paths of outputs captured after the run.
    pub captured_outputs: BTreeSet<PathBuf>,

    /// Why the execution failed.
    pub error: Option<TaskError>,

    /// Digest of the image the task ran on.
    pub image_digest: Option<String>,

    /// Last lines written to stdout.
    pub stdout_tail: Vec<String>,

    /// Last lines written to stderr.
    pub stderr_tail: Vec<String>,

    /// When `execute` was called.
    pub started_at: DateTime<Utc>,

    /// When the terminal state was reached.
    pub finished_at: DateTime<Utc>,
}

impl TaskOutcome {
    /// Wall-clock duration of the execution in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// True if the engine never got to run the command.
    pub fn is_engine_fault(&self) -> bool {
        self.error.as_ref().is_some_and(TaskError::is_engine_fault)
    }
}
