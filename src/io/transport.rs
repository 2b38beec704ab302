//! Transport layer - Request/response facade over a child's stdio
//!
//! [`StdioClient`] owns the child process, its stdin, and one buffer per
//! output stream. Stdout and stderr are drained by background tasks for the
//! whole session; callers only ever see `send`, `receive(timeout)` and `stop`.

use async_trait::async_trait;
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::task::JoinHandle;
use tracing::{Level, debug, info, warn};
use uuid::Uuid;

use crate::error::{ClientError, ProtocolViolation};
use crate::io::buffer::{BufferError, BufferedLine, LineReceiver, message_buffer};
use crate::io::framing::encode_line;
use crate::io::process::{ChildProcess, ProcessSpec, SpawnedProcess};
use crate::io::reader::{StderrLog, spawn_line_reader, spawn_stderr_drain};
use crate::log_rpc_message;
use crate::protocol::{JsonRpcMessage, RequestId};

// ============================================================================
// Constants
// ============================================================================

/// Default time a child gets to exit after SIGTERM before it is killed
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

/// Default number of stderr lines kept for diagnostics
pub const DEFAULT_STDERR_CAPACITY: usize = 200;

/// How long `stop` waits for the reader tasks to observe EOF
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Core transport trait for sending and receiving JSON-RPC messages
#[async_trait]
pub trait Transport: Send {
    /// Write one message and flush it
    async fn send(&mut self, message: &JsonRpcMessage) -> Result<(), ClientError>;

    /// Wait up to `timeout` for the next message
    async fn receive(&mut self, timeout: Duration) -> Result<JsonRpcMessage, ClientError>;

    /// Release the peer; must be safe to call repeatedly
    async fn stop(&mut self);
}

// ============================================================================
// Client Configuration
// ============================================================================

/// Everything needed to launch and tear down a server
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Executable, arguments and environment of the server
    pub process: ProcessSpec,

    /// Time between SIGTERM and SIGKILL during `stop`
    pub stop_grace: Duration,

    /// Number of stderr lines kept for diagnostics
    pub stderr_capacity: usize,
}

impl ClientConfig {
    pub fn new(process: ProcessSpec) -> Self {
        Self {
            process,
            stop_grace: DEFAULT_STOP_GRACE,
            stderr_capacity: DEFAULT_STDERR_CAPACITY,
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_stderr_capacity(mut self, capacity: usize) -> Self {
        self.stderr_capacity = capacity;
        self
    }
}

// ============================================================================
// Stdio Client
// ============================================================================

/// Lifecycle of a [`StdioClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unstarted,
    Started,
    Stopped,
}

impl ClientState {
    fn name(self) -> &'static str {
        match self {
            ClientState::Unstarted => "unstarted",
            ClientState::Started => "started",
            ClientState::Stopped => "stopped",
        }
    }
}

/// Resources that only exist while the child is running
#[derive(Debug)]
struct Connection {
    process: ChildProcess,
    stdin: Option<ChildStdin>,
    stdout: LineReceiver,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
}

/// Line-delimited JSON-RPC client over a child's stdin/stdout
///
/// All state is owned per instance, so any number of clients can run in the
/// same process without sharing buffers.
#[derive(Debug)]
pub struct StdioClient {
    config: ClientConfig,
    session_id: Uuid,
    state: ClientState,
    connection: Option<Connection>,
    stderr_log: StderrLog,
    /// Id of the request whose response has not arrived yet
    pending: Option<RequestId>,
    exit_status: Option<ExitStatus>,
}

impl StdioClient {
    pub fn new(config: ClientConfig) -> Self {
        let stderr_log = StderrLog::new(config.stderr_capacity);
        Self {
            config,
            session_id: Uuid::new_v4(),
            state: ClientState::Unstarted,
            connection: None,
            stderr_log,
            pending: None,
            exit_status: None,
        }
    }

    /// Create and start a client in one step
    pub async fn launch(config: ClientConfig) -> Result<Self, ClientError> {
        let mut client = Self::new(config);
        client.start().await?;
        Ok(client)
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.connection.as_ref().and_then(|c| c.process.pid())
    }

    /// Request id still waiting for its response
    pub fn pending_request(&self) -> Option<&RequestId> {
        self.pending.as_ref()
    }

    /// Exit status collected by `stop`
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Most recent stderr lines of the child, oldest first
    pub fn stderr_tail(&self, n: usize) -> Vec<String> {
        self.stderr_log.tail(n)
    }

    /// Launch the child and start draining its output streams
    pub async fn start(&mut self) -> Result<(), ClientError> {
        if self.state != ClientState::Unstarted {
            return Err(ClientError::InvalidState {
                current: self.state.name(),
                expected: ClientState::Unstarted.name(),
            });
        }

        let SpawnedProcess {
            process,
            stdin,
            stdout,
            stderr,
        } = self.config.process.spawn().map_err(ClientError::Launch)?;

        let (sender, receiver) = message_buffer();
        let stdout_task = spawn_line_reader(stdout, sender, "stdout");
        let stderr_task = spawn_stderr_drain(stderr, self.stderr_log.clone());

        info!(
            session = %self.session_id,
            pid = ?process.pid(),
            "Connected to {}",
            self.config.process.program.display()
        );

        self.connection = Some(Connection {
            process,
            stdin: Some(stdin),
            stdout: receiver,
            stdout_task,
            stderr_task,
        });
        self.state = ClientState::Started;
        Ok(())
    }

    fn connection_mut(&mut self) -> Result<&mut Connection, ClientError> {
        let current = self.state;
        match (current, self.connection.as_mut()) {
            (ClientState::Started, Some(connection)) => Ok(connection),
            _ => Err(ClientError::InvalidState {
                current: current.name(),
                expected: ClientState::Started.name(),
            }),
        }
    }

    /// Serialize, frame, write and flush one message
    ///
    /// Sending a request makes its id the pending id that the next response
    /// must carry.
    pub async fn send(&mut self, message: &JsonRpcMessage) -> Result<(), ClientError> {
        let session_id = self.session_id;
        let connection = self.connection_mut()?;
        let line = encode_line(message)?;

        let stdin = connection.stdin.as_mut().ok_or_else(|| {
            ClientError::Write(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdin already closed",
            ))
        })?;
        stdin.write_all(&line).await.map_err(ClientError::Write)?;
        stdin.flush().await.map_err(ClientError::Write)?;

        log_rpc_message!(
            Level::DEBUG,
            session_id,
            "out",
            message.method().unwrap_or("response"),
            message.id()
        );

        if let JsonRpcMessage::Request(request) = message {
            self.pending = Some(request.id.clone());
        }
        Ok(())
    }

    /// Wait up to `timeout` for the next message from the child
    ///
    /// A timeout leaves the stream untouched, so a late line is returned by
    /// the next call. End of stream is `ConnectionClosed`, every time.
    pub async fn receive(&mut self, timeout: Duration) -> Result<JsonRpcMessage, ClientError> {
        let session_id = self.session_id;
        let connection = self.connection_mut()?;

        let started = Instant::now();
        let raw = match connection.stdout.pop(timeout).await {
            Ok(BufferedLine::Line(raw)) => raw,
            Ok(BufferedLine::Closed) | Err(BufferError::Exhausted) => {
                debug!(session = %session_id, "Server closed stdout");
                return Err(ClientError::ConnectionClosed);
            }
            Err(BufferError::Timeout(_)) => {
                debug!(
                    session = %session_id,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Receive timed out"
                );
                return Err(ClientError::Timeout { after: timeout });
            }
        };

        let message = match JsonRpcMessage::parse(&raw) {
            Ok(message) => message,
            Err(e) => {
                return Err(ClientError::Protocol {
                    raw,
                    violation: ProtocolViolation::Malformed(e),
                });
            }
        };

        if let JsonRpcMessage::Response(response) = &message {
            self.match_pending(response.id.as_ref(), response.error.is_some(), &raw)?;
        }

        log_rpc_message!(
            Level::DEBUG,
            session_id,
            "in",
            message.method().unwrap_or("response"),
            message.id()
        );
        Ok(message)
    }

    /// Check a response id against the pending request
    ///
    /// A null id is only accepted on error responses, where JSON-RPC allows
    /// it when the server could not read the request id.
    fn match_pending(
        &mut self,
        received: Option<&RequestId>,
        is_error: bool,
        raw: &str,
    ) -> Result<(), ClientError> {
        let Some(expected) = self.pending.as_ref() else {
            return Err(ClientError::Protocol {
                raw: raw.to_string(),
                violation: ProtocolViolation::Unsolicited {
                    received: received.cloned(),
                },
            });
        };

        let matches = match received {
            Some(id) => id == expected,
            None => is_error,
        };
        if !matches {
            return Err(ClientError::Protocol {
                raw: raw.to_string(),
                violation: ProtocolViolation::IdMismatch {
                    expected: expected.clone(),
                    received: received.cloned(),
                },
            });
        }

        self.pending = None;
        Ok(())
    }

    /// Terminate and reap the child
    ///
    /// Idempotent: a stopped or never-started client is left as is. Never
    /// fails, also when the child already exited on its own.
    pub async fn stop(&mut self) -> Option<ExitStatus> {
        let Some(connection) = self.connection.take() else {
            if self.state == ClientState::Unstarted {
                self.state = ClientState::Stopped;
            }
            return self.exit_status;
        };
        self.state = ClientState::Stopped;
        self.pending = None;

        let Connection {
            mut process,
            stdin,
            stdout,
            mut stdout_task,
            mut stderr_task,
        } = connection;

        // Closing stdin lets a well-behaved server exit on its own
        drop(stdin);
        drop(stdout);

        let status = process.terminate(self.config.stop_grace).await;
        self.exit_status = status;

        // Readers finish once the pipes hit EOF; a grandchild holding them
        // open must not stall shutdown
        for (label, task) in [("stdout", &mut stdout_task), ("stderr", &mut stderr_task)] {
            if tokio::time::timeout(READER_JOIN_TIMEOUT, &mut *task)
                .await
                .is_err()
            {
                warn!(session = %self.session_id, "{} reader still running, aborting", label);
                task.abort();
            }
        }

        for line in self.stderr_log.tail(self.stderr_log.capacity()) {
            debug!(session = %self.session_id, "server stderr: {}", line);
        }
        info!(session = %self.session_id, status = ?status, "Server stopped");

        status
    }
}

#[async_trait]
impl Transport for StdioClient {
    async fn send(&mut self, message: &JsonRpcMessage) -> Result<(), ClientError> {
        StdioClient::send(self, message).await
    }

    async fn receive(&mut self, timeout: Duration) -> Result<JsonRpcMessage, ClientError> {
        StdioClient::receive(self, timeout).await
    }

    async fn stop(&mut self) {
        StdioClient::stop(self).await;
    }
}

// ============================================================================
// Mock Transport Implementation
// ============================================================================

/// Mock transport for testing - replays scripted replies
#[cfg(test)]
pub struct MockTransport {
    /// Messages that were sent via this transport
    sent_messages: std::sync::Arc<std::sync::Mutex<Vec<JsonRpcMessage>>>,

    /// Replies returned by receive(), in order; exhausted means closed
    replies: std::collections::VecDeque<Result<JsonRpcMessage, ClientError>>,

    stopped: bool,
}

#[cfg(test)]
impl MockTransport {
    pub fn new() -> Self {
        Self {
            sent_messages: Default::default(),
            replies: Default::default(),
            stopped: false,
        }
    }

    /// Create a mock transport with predefined replies
    pub fn with_replies(replies: Vec<JsonRpcMessage>) -> Self {
        let mut transport = Self::new();
        transport.replies.extend(replies.into_iter().map(Ok));
        transport
    }

    pub fn push_error(&mut self, error: ClientError) {
        self.replies.push_back(Err(error));
    }

    /// Shared view of everything sent so far
    pub fn sent_handle(&self) -> std::sync::Arc<std::sync::Mutex<Vec<JsonRpcMessage>>> {
        std::sync::Arc::clone(&self.sent_messages)
    }

    pub fn sent_messages(&self) -> Vec<JsonRpcMessage> {
        self.sent_messages.lock().unwrap().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: &JsonRpcMessage) -> Result<(), ClientError> {
        if self.stopped {
            return Err(ClientError::InvalidState {
                current: "stopped",
                expected: "started",
            });
        }
        self.sent_messages.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn receive(&mut self, _timeout: Duration) -> Result<JsonRpcMessage, ClientError> {
        self.replies
            .pop_front()
            .unwrap_or(Err(ClientError::ConnectionClosed))
    }

    async fn stop(&mut self) {
        self.stopped = true;
    }
}

// ============================================================================
// Tests
// ============================================================================
