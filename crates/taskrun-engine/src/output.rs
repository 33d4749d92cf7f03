//! Bounded capture of command output.

use std::collections::VecDeque;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

use crate::event::{publish, EventSink, OutputStream, TaskEvent};

/// Keeps the last `capacity` lines written to a stream.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
    dropped: u64,
}

impl OutputTail {
    /// Create an empty tail.
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    /// Number of lines that no longer fit.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Retained lines, oldest first.
    pub fn into_lines(self) -> Vec<String> {
        self.lines.into()
    }
}

/// Read `reader` to EOF line by line, logging each line, forwarding it to
/// `events` and keeping a bounded tail. Non-UTF-8 bytes are replaced.
pub async fn capture<R>(
    reader: R,
    stream: OutputStream,
    capacity: usize,
    events: Option<EventSink>,
) -> OutputTail
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut tail = OutputTail::new(capacity);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break, // EOF
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                debug!(stream = ?stream, line = %line, "Task output");
                if let Some(tx) = &events {
                    publish(
                        tx,
                        TaskEvent::Output {
                            stream,
                            line: line.clone(),
                        },
                    );
                }
                tail.push(line);
            }
            Err(e) => {
                warn!(stream = ?stream, error = %e, "Error reading task output");
                break;
            }
        }
    }
    tail
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_tail_evicts_oldest() {
        let mut tail = OutputTail::new(2);
        for line in ["a", "b", "c"] {
            tail.push(line.to_string());
        }
        assert_eq!(tail.dropped(), 1);
        assert_eq!(tail.into_lines(), vec!["b", "c"]);
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let mut tail = OutputTail::new(0);
        tail.push("x".to_string());
        assert!(tail.into_lines().is_empty());
    }

    #[tokio::test]
    async fn test_capture_forwards_lines() {
        let (tx, mut rx) = mpsc::channel(8);
        let input: &[u8] = b"first\r\nsecond\nno newline";
        let tail = capture(input, OutputStream::Stdout, 10, Some(tx)).await;

        assert_eq!(tail.into_lines(), vec!["first", "second", "no newline"]);
        let first = rx.recv().await.unwrap();
        assert_eq!(
            first,
            TaskEvent::Output {
                stream: OutputStream::Stdout,
                line: "first".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_capture_never_waits_on_a_full_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let input = (1..=50).map(|n| format!("{n}\n")).collect::<String>();
        let tail = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            capture(input.as_bytes(), OutputStream::Stdout, 100, Some(tx)),
        )
        .await
        .unwrap();

        assert_eq!(tail.into_lines().len(), 50);
        let mut forwarded = 0;
        while rx.try_recv().is_ok() {
            forwarded += 1;
        }
        assert_eq!(forwarded, 4);
    }

    #[tokio::test]
    async fn test_capture_replaces_invalid_utf8() {
        let input: &[u8] = b"ok \xff\n";
        let tail = capture(input, OutputStream::Stderr, 10, None).await;
        assert_eq!(tail.into_lines(), vec!["ok \u{fffd}"]);
    }
}
