//! Stream readers - background draining of child output streams
//!
//! A child process blocks as soon as the OS pipe behind its stdout or stderr
//! fills up. Both streams are therefore drained by dedicated tasks for the whole
//! life of the process, independent of whether anybody is waiting for output.

use crate::io::buffer::{BufferedLine, LineSender};
use crate::io::framing::{LINE_TERMINATOR, decode_text, strip_line_terminator};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{error, trace};

// ============================================================================
// Stdout Reader
// ============================================================================

/// Spawn a task that forwards every line of `stream` into `sender`
///
/// Lines are forwarded verbatim (minus the terminator); parsing happens in
/// the consumer. On EOF or a read error exactly one [`BufferedLine::Closed`]
/// is pushed and the task ends.
pub fn spawn_line_reader<R>(stream: R, sender: LineSender, label: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut count: u64 = 0;

        loop {
            let mut raw = Vec::new();
            match reader.read_until(LINE_TERMINATOR, &mut raw).await {
                Ok(0) => {
                    trace!(stream = label, lines = count, "Stream reader reached EOF");
                    break;
                }
                Ok(_) => {
                    strip_line_terminator(&mut raw);
                    let line = decode_text(raw);
                    count += 1;
                    trace!(stream = label, "Read line: {}", line);

                    if !sender.push(BufferedLine::Line(line)) {
                        trace!(stream = label, "Consumer dropped, stopping reader");
                        return;
                    }
                }
                Err(e) => {
                    error!(stream = label, "Failed to read from child: {}", e);
                    break;
                }
            }
        }

        sender.push(BufferedLine::Closed);
    })
}

// ============================================================================
// Stderr Log
// ============================================================================

/// Bounded log of the most recent stderr lines of a child
///
/// Cloning shares the underlying buffer.
#[derive(Debug, Clone)]
pub struct StderrLog {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl StderrLog {
    /// Create a log that keeps at most `capacity` lines (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        // A panicking writer cannot leave a VecDeque half-updated
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a line, evicting the oldest one when full
    pub fn push(&self, line: String) {
        let mut lines = self.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// The last `n` lines, oldest first
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Spawn a task that drains `stream` into `log`
///
/// Blank lines are dropped; everything else is kept verbatim.
pub fn spawn_stderr_drain<R>(stream: R, log: StderrLog) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);

        loop {
            let mut raw = Vec::new();
            match reader.read_until(LINE_TERMINATOR, &mut raw).await {
                Ok(0) => {
                    trace!("StderrDrain: EOF reached");
                    break;
                }
                Ok(_) => {
                    strip_line_terminator(&mut raw);
                    let line = decode_text(raw);
                    if !line.trim().is_empty() {
                        trace!("StderrDrain: {}", line);
                        log.push(line);
                    }
                }
                Err(e) => {
                    error!("Failed to read from stderr: {}", e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::buffer::message_buffer;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_line_reader_forwards_lines_then_closed() {
        let (mut writer, stream) = tokio::io::duplex(64);
        let (sender, mut receiver) = message_buffer();
        let task = spawn_line_reader(stream, sender, "stdout");

        writer
            .write_all(b"{\"a\":1}\r\n\nnot json\n{\"tail\"")
            .await
            .unwrap();
        drop(writer);

        let expected = ["{\"a\":1}", "", "not json", "{\"tail\""];
        for text in expected {
            assert_eq!(
                receiver.pop(WAIT).await.unwrap(),
                BufferedLine::Line(text.to_string())
            );
        }
        assert_eq!(receiver.pop(WAIT).await.unwrap(), BufferedLine::Closed);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_line_reader_keeps_order_across_small_pipe() {
        // A tiny pipe forces the writer to wait on the reader repeatedly
        let (mut writer, stream) = tokio::io::duplex(16);
        let (sender, mut receiver) = message_buffer();
        spawn_line_reader(stream, sender, "stdout");

        let producer = tokio::spawn(async move {
            for i in 0..500 {
                writer
                    .write_all(format!("{{\"seq\":{i}}}\n").as_bytes())
                    .await
                    .unwrap();
            }
        });

        for i in 0..500 {
            assert_eq!(
                receiver.pop(WAIT).await.unwrap(),
                BufferedLine::Line(format!("{{\"seq\":{i}}}"))
            );
        }
        producer.await.unwrap();
        assert_eq!(receiver.pop(WAIT).await.unwrap(), BufferedLine::Closed);
    }

    #[tokio::test]
    async fn test_stderr_drain_keeps_bounded_tail() {
        let (mut writer, stream) = tokio::io::duplex(32);
        let log = StderrLog::new(3);
        let task = spawn_stderr_drain(stream, log.clone());

        writer
            .write_all(b"one\n\ntwo\nthree\n   \nfour\nfive\n")
            .await
            .unwrap();
        drop(writer);
        task.await.unwrap();

        assert_eq!(log.len(), 3);
        assert_eq!(log.tail(10), vec!["three", "four", "five"]);
        assert_eq!(log.tail(2), vec!["four", "five"]);
    }

    #[test]
    fn test_stderr_log_zero_capacity_keeps_one_line() {
        let log = StderrLog::new(0);
        assert_eq!(log.capacity(), 1);
        assert!(log.is_empty());

        log.push("first".to_string());
        log.push("second".to_string());
        assert_eq!(log.tail(5), vec!["second"]);
    }
}
