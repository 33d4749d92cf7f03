//! Presentation of task outcomes.
//!
//! Separates "the task ran and failed" from "the task could not run" and maps
//! both onto process exit codes for the caller.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use taskrun_core::{ExecutionId, TaskError, TaskOutcome};

/// Exit code when the run exceeded its timeout.
pub const EXIT_TIMED_OUT: i32 = 124;

/// Exit code when the engine could not run the task.
pub const EXIT_ENGINE_FAULT: i32 = 125;

/// Exit code when the run was cancelled.
pub const EXIT_CANCELLED: i32 = 130;

/// Coarse classification of an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Succeeded,
    /// The command ran and exited non-zero.
    TaskFailed,
    /// The command ran past its timeout.
    TimedOut,
    Cancelled,
    /// The command never ran, or its results could not be collected.
    EngineFault,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::TaskFailed => "failed",
            Self::TimedOut => "timed out",
            Self::Cancelled => "cancelled",
            Self::EngineFault => "errored",
        };
        f.write_str(s)
    }
}

/// Structured summary of one execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub execution_id: ExecutionId,
    pub verdict: Verdict,

    /// Whether running the same task again may give a different result
    /// without changing it.
    pub retryable: bool,

    /// One-line human summary.
    pub summary: String,

    /// Exit code to present upstream.
    pub exit_code: i32,

    /// Exit code of the command itself, if it finished.
    pub task_exit_code: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,

    pub captured_outputs: Vec<PathBuf>,
    pub duration_ms: i64,

    /// Last stderr lines, kept for failed runs only.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stderr_tail: Vec<String>,
}

/// Turns outcomes into reports.
#[derive(Debug, Clone)]
pub struct ResultReporter {
    stderr_lines: usize,
}

impl Default for ResultReporter {
    fn default() -> Self {
        Self { stderr_lines: 20 }
    }
}

impl ResultReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to set how many stderr lines a failed report carries.
    pub fn with_stderr_lines(mut self, lines: usize) -> Self {
        self.stderr_lines = lines;
        self
    }

    /// Summarize an outcome. Pure.
    pub fn report(&self, outcome: &TaskOutcome) -> Report {
        let verdict = verdict(outcome);
        let exit_code = match verdict {
            Verdict::Succeeded => 0,
            Verdict::TaskFailed => outcome.exit_code.unwrap_or(1),
            Verdict::TimedOut => EXIT_TIMED_OUT,
            Verdict::Cancelled => EXIT_CANCELLED,
            Verdict::EngineFault => EXIT_ENGINE_FAULT,
        };
        let retryable = matches!(
            outcome.error,
            Some(
                TaskError::PullFailed { .. }
                    | TaskError::SandboxCreateError { .. }
                    | TaskError::FinalizeError { .. }
            )
        );
        let duration_ms = outcome.duration_ms();

        let summary = match (&verdict, &outcome.error) {
            (Verdict::Succeeded, _) => {
                format!("task succeeded in {}", format_duration(duration_ms))
            }
            (Verdict::TaskFailed, _) => format!(
                "task failed with exit code {} after {}",
                exit_code,
                format_duration(duration_ms)
            ),
            (Verdict::TimedOut, Some(TaskError::ProcessTimedOut { timeout_ms })) => format!(
                "task timed out after {}",
                format_duration(*timeout_ms as i64)
            ),
            (Verdict::TimedOut, _) => "task timed out".to_string(),
            (Verdict::Cancelled, _) => "task cancelled".to_string(),
            (Verdict::EngineFault, Some(e)) => format!("task could not run: {e}"),
            (Verdict::EngineFault, None) => "task could not run".to_string(),
        };

        let stderr_tail = if verdict == Verdict::Succeeded {
            Vec::new()
        } else {
            let skip = outcome.stderr_tail.len().saturating_sub(self.stderr_lines);
            outcome.stderr_tail[skip..].to_vec()
        };

        Report {
            execution_id: outcome.execution_id.clone(),
            verdict,
            retryable,
            summary,
            exit_code,
            task_exit_code: outcome.exit_code,
            error: outcome.error.clone(),
            image_digest: outcome.image_digest.clone(),
            captured_outputs: outcome.captured_outputs.iter().cloned().collect(),
            duration_ms,
            stderr_tail,
        }
    }
}

/// Summarize an outcome with the default reporter.
pub fn report(outcome: &TaskOutcome) -> Report {
    ResultReporter::default().report(outcome)
}

fn verdict(outcome: &TaskOutcome) -> Verdict {
    match &outcome.error {
        None if outcome.succeeded => Verdict::Succeeded,
        None => Verdict::TaskFailed,
        Some(TaskError::NonZeroExit { .. }) => Verdict::TaskFailed,
        Some(TaskError::ProcessTimedOut { .. }) => Verdict::TimedOut,
        Some(TaskError::Cancelled) => Verdict::Cancelled,
        Some(_) => Verdict::EngineFault,
    }
}

fn format_duration(ms: i64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: {}", self.execution_id, self.summary)?;
        if let Some(digest) = &self.image_digest {
            writeln!(f, "  image:   {digest}")?;
        }
        for output in &self.captured_outputs {
            writeln!(f, "  output:  {}", output.display())?;
        }
        if self.retryable {
            writeln!(f, "  retry:   may succeed if run again")?;
        }
        if !self.stderr_tail.is_empty() {
            writeln!(f, "  last stderr lines:")?;
            for line in &self.stderr_tail {
                writeln!(f, "    {line}")?;
            }
        }
        Ok(())
    }
}
