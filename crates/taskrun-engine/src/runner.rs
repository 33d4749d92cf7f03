//! The task state machine.
//!
//! A [`TaskRunner`] owns one [`TaskSpec`] and drives it through
//! `Pending → Resolving → Mounting → Running → Finalizing` to `Succeeded`
//! or `Failed`. Every path out of `Mounting` destroys the sandbox it
//! created and releases the cache locks it took.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskrun_core::{
    BindingKind, ExecutionId, SandboxId, TaskError, TaskOutcome, TaskSpec, TaskState,
};

use crate::event::{publish, EventSink, TaskEvent};
use crate::image::ImageResolver;
use crate::lock::CacheLocks;
use crate::sandbox::{
    RunCommand, RunControl, RunExit, SandboxBackend, SandboxError, SandboxHandle,
};
use crate::volume::{MountPlan, VolumeSet};

/// Mutable facts gathered while the runner advances.
#[derive(Debug, Default)]
struct Record {
    exit_code: Option<i32>,
    image_digest: Option<String>,
    captured_outputs: BTreeSet<PathBuf>,
    stdout_tail: Vec<String>,
    stderr_tail: Vec<String>,
}

/// Executes one task. Single use: [`TaskRunner::execute`] consumes it.
pub struct TaskRunner {
    execution_id: ExecutionId,
    spec: TaskSpec,
    resolver: Arc<ImageResolver>,
    backend: Arc<dyn SandboxBackend>,
    locks: Arc<CacheLocks>,
    timeout: Option<Duration>,
    grace: Duration,
    tail_lines: usize,
    cancel: CancellationToken,
    events: Option<EventSink>,
    state: TaskState,
}

impl TaskRunner {
    /// Create a runner for `spec`. Usually obtained from
    /// [`Engine::runner`](crate::Engine::runner).
    pub fn new(
        spec: TaskSpec,
        resolver: Arc<ImageResolver>,
        backend: Arc<dyn SandboxBackend>,
        locks: Arc<CacheLocks>,
    ) -> Self {
        Self {
            execution_id: ExecutionId::generate(),
            spec,
            resolver,
            backend,
            locks,
            timeout: None,
            grace: Duration::from_secs(10),
            tail_lines: 200,
            cancel: CancellationToken::new(),
            events: None,
            state: TaskState::Pending,
        }
    }

    /// Builder method to limit the run's wall-clock time.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builder method to set the SIGTERM to SIGKILL grace period.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Builder method to set how many output lines the outcome keeps.
    pub fn with_tail_lines(mut self, lines: usize) -> Self {
        self.tail_lines = lines;
        self
    }

    /// Builder method to use an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Builder method to publish progress events.
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    /// Builder method to set the execution id.
    pub fn with_execution_id(mut self, id: ExecutionId) -> Self {
        self.execution_id = id;
        self
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// A token that cancels this execution when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the task to a terminal state.
    pub async fn execute(mut self) -> TaskOutcome {
        let started_at = Utc::now();
        info!(
            execution = %self.execution_id,
            image = %self.spec.image,
            executable = %self.spec.run.executable.display(),
            "Executing task"
        );

        let mut record = Record::default();
        let error = self.drive(&mut record).await.err();
        let succeeded = error.is_none() && record.exit_code == Some(0);
        self.advance(if succeeded {
            TaskState::Succeeded
        } else {
            TaskState::Failed
        });

        match &error {
            None => info!(execution = %self.execution_id, "Task succeeded"),
            Some(e) if e.is_engine_fault() => {
                error!(execution = %self.execution_id, error = %e, "Task could not run")
            }
            Some(e) => info!(execution = %self.execution_id, error = %e, "Task failed"),
        }

        TaskOutcome {
            execution_id: self.execution_id,
            state: self.state,
            exit_code: record.exit_code,
            succeeded,
            captured_outputs: record.captured_outputs,
            error,
            image_digest: record.image_digest,
            stdout_tail: record.stdout_tail,
            stderr_tail: record.stderr_tail,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn drive(&mut self, record: &mut Record) -> Result<(), TaskError> {
        self.check_cancelled()?;
        self.advance(TaskState::Resolving);

        self.spec.validate().map_err(|e| TaskError::InvalidTask {
            reason: e.to_string(),
        })?;
        let image = tokio::select! {
            resolved = self.resolver.resolve(&self.spec.image) => resolved?,
            _ = self.cancel.cancelled() => return Err(TaskError::Cancelled),
        };
        record.image_digest = Some(image.digest.clone());

        self.check_cancelled()?;
        self.advance(TaskState::Mounting);

        if !self.backend.supports(self.spec.platform) {
            return Err(TaskError::SandboxCreateError {
                reason: format!(
                    "the {} backend cannot run {} tasks",
                    self.backend.name(),
                    self.spec.platform
                ),
            });
        }

        let id = SandboxId::generate();
        let plan = VolumeSet::for_sandbox(&id).bind(self.spec.bindings())?;

        let locks = tokio::select! {
            guards = self.locks.acquire_all(plan.cache_host_paths()) => {
                guards.map_err(|e| TaskError::SandboxCreateError { reason: e.to_string() })?
            }
            _ = self.cancel.cancelled() => return Err(TaskError::Cancelled),
        };
        self.check_cancelled()?;

        let handle = self
            .backend
            .create(id, image, &plan)
            .await
            .map_err(|e| TaskError::SandboxCreateError {
                reason: e.to_string(),
            })?;

        let result = self.run_and_finalize(&handle, &plan, record).await;

        let destroyed = self.backend.destroy(&handle).await;
        drop(locks);

        match (result, destroyed) {
            (Err(e), Err(destroy)) => {
                warn!(sandbox = %handle.id, error = %destroy, "Failed to destroy sandbox");
                Err(e)
            }
            (Ok(()), Err(destroy)) => Err(TaskError::FinalizeError {
                reason: destroy.to_string(),
            }),
            (result, Ok(())) => result,
        }
    }

    async fn run_and_finalize(
        &mut self,
        handle: &SandboxHandle,
        plan: &MountPlan,
        record: &mut Record,
    ) -> Result<(), TaskError> {
        self.check_cancelled()?;
        self.advance(TaskState::Running);

        let command = RunCommand {
            working_dir: plan.resolve(&self.spec.run.working_dir),
            executable: self.spec.run.executable.clone(),
            args: self.spec.run.args.clone(),
            env: self.spec.params.clone(),
        };
        let control = RunControl {
            timeout: self.timeout,
            cancel: self.cancel.clone(),
            grace: self.grace,
            events: self.events.clone(),
            tail_lines: self.tail_lines,
        };
        let run = self.backend.run(handle, &command, control).await;

        self.advance(TaskState::Finalizing);

        let report = run.map_err(|e| TaskError::SandboxCreateError {
            reason: format!("sandbox failed while running the task: {e}"),
        })?;
        record.stdout_tail = report.stdout_tail;
        record.stderr_tail = report.stderr_tail;

        let code = match report.exit {
            RunExit::Exited(code) => code,
            stopped => {
                // Caches are kept; outputs of a stopped run are not.
                if let Err(e) = self.persist_caches(handle, plan).await {
                    warn!(execution = %self.execution_id, error = %e, "Cache persistence failed after stopping task");
                }
                return Err(match stopped {
                    RunExit::TimedOut => TaskError::ProcessTimedOut {
                        timeout_ms: self.timeout.map_or(0, |t| t.as_millis() as u64),
                    },
                    _ => TaskError::Cancelled,
                });
            }
        };
        record.exit_code = Some(code);

        let finalized = match self.persist_caches(handle, plan).await {
            Ok(()) => self.capture_outputs(handle, plan, record).await,
            Err(e) => Err(e),
        };
        if code != 0 {
            if let Err(e) = finalized {
                warn!(execution = %self.execution_id, error = %e, "Finalization failed after task failure");
            }
            return Err(TaskError::NonZeroExit { code });
        }
        finalized
    }

    async fn persist_caches(&self, handle: &SandboxHandle, plan: &MountPlan) -> Result<(), TaskError> {
        for mount in plan.of_kind(BindingKind::Cache) {
            self.backend
                .export(handle, mount)
                .await
                .map_err(finalize_error)?;
            debug!(cache = %mount.binding.name, "Persisted cache");
        }
        Ok(())
    }

    async fn capture_outputs(
        &self,
        handle: &SandboxHandle,
        plan: &MountPlan,
        record: &mut Record,
    ) -> Result<(), TaskError> {
        for mount in plan.of_kind(BindingKind::Output) {
            self.backend
                .export(handle, mount)
                .await
                .map_err(finalize_error)?;
            record
                .captured_outputs
                .insert(mount.binding.host_path.clone());
            info!(output = %mount.binding.name, path = %mount.binding.host_path.display(), "Captured output");
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), TaskError> {
        if self.cancel.is_cancelled() {
            info!(execution = %self.execution_id, state = %self.state, "Cancellation observed");
            return Err(TaskError::Cancelled);
        }
        Ok(())
    }

    fn advance(&mut self, next: TaskState) {
        let from = self.state;
        match from.transition(next) {
            Ok(to) => {
                self.state = to;
                debug!(execution = %self.execution_id, from = %from, to = %to, "State changed");
                if let Some(events) = &self.events {
                    publish(
                        events,
                        TaskEvent::StateChanged {
                            execution_id: self.execution_id.clone(),
                            from,
                            to,
                            at: Utc::now(),
                        },
                    );
                }
            }
            Err(e) => error!(execution = %self.execution_id, error = %e, "Rejected state change"),
        }
    }
}

fn finalize_error(e: SandboxError) -> TaskError {
    TaskError::FinalizeError {
        reason: e.to_string(),
    }
}
