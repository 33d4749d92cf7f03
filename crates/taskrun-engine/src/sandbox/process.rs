//! Child process supervision: spawn, capture, timeout, termination.

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{RunControl, RunExit, RunReport, SandboxError, SandboxHandle};
use crate::event::{publish, OutputStream, TaskEvent};
use crate::output::{self, OutputTail};

/// How long to wait for the output readers once the process is gone.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit code a shell reports for a command it cannot find.
const EXIT_NOT_FOUND: i32 = 127;

/// Exit code a shell reports for a command it cannot execute.
const EXIT_NOT_EXECUTABLE: i32 = 126;

enum Stop {
    Exited(io::Result<ExitStatus>),
    Deadline,
    Cancel,
}

/// Spawn `command` in its own process group and supervise it.
pub(super) async fn supervise(
    mut command: Command,
    executable: &Path,
    handle: &SandboxHandle,
    control: RunControl,
) -> Result<RunReport, SandboxError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return spawn_failure(executable, e, &control),
    };

    let pid = child.id().and_then(|p| i32::try_from(p).ok());
    handle.set_process_group(pid);
    info!(sandbox = %handle.id, pid = ?pid, executable = %executable.display(), "Process started");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::io("capture stdout", io::Error::other("not piped")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SandboxError::io("capture stderr", io::Error::other("not piped")))?;
    let stdout_task = tokio::spawn(output::capture(
        stdout,
        OutputStream::Stdout,
        control.tail_lines,
        control.events.clone(),
    ));
    let stderr_task = tokio::spawn(output::capture(
        stderr,
        OutputStream::Stderr,
        control.tail_lines,
        control.events.clone(),
    ));

    let deadline = async {
        match control.timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let stop = tokio::select! {
        biased;
        status = child.wait() => Stop::Exited(status),
        _ = &mut deadline => Stop::Deadline,
        _ = control.cancel.cancelled() => Stop::Cancel,
    };

    let exit = match stop {
        Stop::Exited(status) => {
            let status = status.map_err(|e| SandboxError::io("wait for process", e))?;
            RunExit::Exited(exit_code(status))
        }
        Stop::Deadline => {
            warn!(sandbox = %handle.id, timeout = ?control.timeout, "Process timed out");
            terminate(&mut child, pid, control.grace).await;
            RunExit::TimedOut
        }
        Stop::Cancel => {
            info!(sandbox = %handle.id, "Stopping process on cancellation");
            terminate(&mut child, pid, control.grace).await;
            RunExit::Cancelled
        }
    };

    // Whatever the leader left running dies with it.
    kill_group(pid);
    handle.set_process_group(None);

    let stdout_tail = drain(stdout_task, OutputStream::Stdout).await;
    let stderr_tail = drain(stderr_task, OutputStream::Stderr).await;

    info!(sandbox = %handle.id, exit = ?exit, "Process finished");
    Ok(RunReport {
        exit,
        stdout_tail: stdout_tail.into_lines(),
        stderr_tail: stderr_tail.into_lines(),
    })
}

/// SIGTERM the group, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child, pid: Option<i32>, grace: Duration) {
    #[cfg(unix)]
    signal_group(pid, nix::sys::signal::Signal::SIGTERM);
    #[cfg(not(unix))]
    if let Err(e) = child.start_kill() {
        debug!(pid = ?pid, error = %e, "Process already gone");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!(pid = ?pid, "Process stopped within grace period"),
        Err(_) => {
            warn!(pid = ?pid, grace = ?grace, "Process ignored SIGTERM, killing");
            kill_group(pid);
            if let Err(e) = child.kill().await {
                debug!(pid = ?pid, error = %e, "Process already gone");
            }
        }
    }
}

/// SIGKILL a process group, if there is one.
pub(super) fn kill_group(pid: Option<i32>) {
    #[cfg(unix)]
    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
    #[cfg(not(unix))]
    let _ = pid;
}

#[cfg(unix)]
fn signal_group(pid: Option<i32>, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Some(pid) = pid else { return };
    match killpg(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid = pid, signal = ?signal, error = %e, "Failed to signal process group"),
    }
}

async fn drain(task: JoinHandle<OutputTail>, stream: OutputStream) -> OutputTail {
    let abort = task.abort_handle();
    match tokio::time::timeout(READER_DRAIN_TIMEOUT, task).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(e)) => {
            warn!(stream = ?stream, error = %e, "Output reader failed");
            OutputTail::new(0)
        }
        Err(_) => {
            warn!(stream = ?stream, "Output still open after process exit, giving up on it");
            abort.abort();
            OutputTail::new(0)
        }
    }
}

/// A command that cannot be started fails the way a shell would report it.
fn spawn_failure(
    executable: &Path,
    error: io::Error,
    control: &RunControl,
) -> Result<RunReport, SandboxError> {
    let code = match error.kind() {
        io::ErrorKind::NotFound => EXIT_NOT_FOUND,
        io::ErrorKind::PermissionDenied => EXIT_NOT_EXECUTABLE,
        _ => {
            return Err(SandboxError::Spawn {
                executable: executable.to_path_buf(),
                source: error,
            })
        }
    };

    let line = format!("taskrun: {}: {error}", executable.display());
    warn!(executable = %executable.display(), code, error = %error, "Cannot start process");
    if let Some(tx) = &control.events {
        publish(
            tx,
            TaskEvent::Output {
                stream: OutputStream::Stderr,
                line: line.clone(),
            },
        );
    }
    Ok(RunReport {
        exit: RunExit::Exited(code),
        stdout_tail: Vec::new(),
        stderr_tail: vec![line],
    })
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
