//! Progress events published while a task executes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::trace;

use taskrun_core::{ExecutionId, TaskState};

/// Which stream a line of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// An event emitted by a [`TaskRunner`](crate::TaskRunner).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    /// The state machine advanced.
    StateChanged {
        execution_id: ExecutionId,
        from: TaskState,
        to: TaskState,
        at: DateTime<Utc>,
    },
    /// The command wrote a line.
    Output { stream: OutputStream, line: String },
}

/// Sending half handed to the runner. Events are dropped while the
/// channel is full or after the receiver goes away; execution never waits
/// on a slow or missing listener.
pub type EventSink = mpsc::Sender<TaskEvent>;

/// Offer `event` to `sink` without waiting.
pub(crate) fn publish(sink: &EventSink, event: TaskEvent) {
    match sink.try_send(event) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(event)) => trace!(event = ?event, "Event channel full, dropping event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(n: usize) -> TaskEvent {
        TaskEvent::Output {
            stream: OutputStream::Stdout,
            line: n.to_string(),
        }
    }

    #[test]
    fn test_publish_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(2);
        for n in 0..5 {
            publish(&tx, line(n));
        }
        assert_eq!(rx.try_recv().unwrap(), line(0));
        assert_eq!(rx.try_recv().unwrap(), line(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_ignores_closed_channel() {
        let (tx, rx) = mpsc::channel(2);
        drop(rx);
        publish(&tx, line(0));
    }
}
