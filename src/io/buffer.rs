//! Message buffer - hand-off of stream lines from a reader task to a consumer
//!
//! Each child output stream gets exactly one producer (its reader task) and one
//! consumer. Pushing never blocks so the reader can keep draining the pipe no
//! matter how slow the consumer is. End of stream travels through the same
//! queue as data so it can never overtake the lines produced before it.

use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

// ============================================================================
// Buffered Items
// ============================================================================

/// One item pulled from a child output stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferedLine {
    /// A line with its terminator stripped (may be empty)
    Line(String),
    /// The stream reached end of file
    Closed,
}

/// Errors returned by [`LineReceiver::pop`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("No line arrived within {0:?}")]
    Timeout(Duration),

    #[error("End of stream was already delivered")]
    Exhausted,
}

// ============================================================================
// Producer / Consumer Halves
// ============================================================================

/// Create a connected producer/consumer pair
pub fn message_buffer() -> (LineSender, LineReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        LineSender { tx },
        LineReceiver {
            rx,
            closed_delivered: false,
        },
    )
}

/// Producer half, owned by a stream reader task
#[derive(Debug)]
pub struct LineSender {
    tx: mpsc::UnboundedSender<BufferedLine>,
}

impl LineSender {
    /// Push an item without blocking
    ///
    /// Returns false once the consumer has gone away.
    pub fn push(&self, item: BufferedLine) -> bool {
        self.tx.send(item).is_ok()
    }
}

/// Consumer half, owned by the transport client
#[derive(Debug)]
pub struct LineReceiver {
    rx: mpsc::UnboundedReceiver<BufferedLine>,
    closed_delivered: bool,
}

impl LineReceiver {
    /// Wait up to `timeout` for the next item
    ///
    /// A timeout consumes nothing: a line that arrives later is returned by
    /// the next call. `Closed` is returned exactly once; afterwards every call
    /// fails with [`BufferError::Exhausted`] without waiting. A producer that
    /// vanished without pushing `Closed` is reported as `Closed`.
    pub async fn pop(&mut self, timeout: Duration) -> Result<BufferedLine, BufferError> {
        if self.closed_delivered {
            return Err(BufferError::Exhausted);
        }

        // mpsc::Receiver::recv is cancel safe, so dropping it on timeout loses nothing
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(BufferedLine::Line(line))) => Ok(BufferedLine::Line(line)),
            Ok(Some(BufferedLine::Closed)) | Ok(None) => {
                trace!("LineReceiver: end of stream delivered");
                self.closed_delivered = true;
                self.rx.close();
                Ok(BufferedLine::Closed)
            }
            Err(_) => Err(BufferError::Timeout(timeout)),
        }
    }

    /// Whether end of stream has already been handed to the consumer
    pub fn is_exhausted(&self) -> bool {
        self.closed_delivered
    }
}
