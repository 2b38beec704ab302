//! Process management layer
//!
//! Launches the server under test with all three stdio streams piped and
//! tears it down again, completely separate from framing and protocol concerns.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

// ============================================================================
// Process Errors
// ============================================================================

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,
}

// ============================================================================
// Launch Specification
// ============================================================================

/// What to launch: executable, arguments and environment overrides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Executable to run
    pub program: PathBuf,

    /// Command line arguments
    pub args: Vec<String>,

    /// Environment variables set on top of the inherited environment
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Spawn the process with stdin, stdout and stderr piped
    ///
    /// The child is killed if the returned handle is dropped without being
    /// terminated, so no exit path can leak it.
    pub fn spawn(&self) -> Result<SpawnedProcess, ProcessError> {
        info!("Starting process: {} {:?}", self.program.display(), self.args);

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let pid = child.id();
        info!("Process started with PID: {:?}", pid);

        // Take the pipes before handing the child over
        let stdin = child.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        Ok(SpawnedProcess {
            process: ChildProcess { child, pid },
            stdin,
            stdout,
            stderr,
        })
    }
}

/// A freshly spawned process and its three pipes
#[derive(Debug)]
pub struct SpawnedProcess {
    pub process: ChildProcess,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

// ============================================================================
// Running Process
// ============================================================================

/// Handle to a running child process
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    /// Captured at spawn; tokio forgets the id once the child is reaped
    pid: Option<u32>,
}

impl ChildProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status if the process has already exited, without blocking
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!("Failed to poll process {:?}: {}", self.pid, e);
                None
            }
        }
    }

    /// Terminate and reap the process
    ///
    /// Sends SIGTERM, waits up to `grace` for the process to exit, then
    /// force kills it. A process that already exited is simply reaped.
    /// Returns the exit status, or None if it could not be collected.
    pub async fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
        if let Some(status) = self.try_exit_status() {
            debug!("Process {:?} already exited with {}", self.pid, status);
            return Some(status);
        }

        self.signal_terminate();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!("Process {:?} exited with status: {}", self.pid, status);
                return Some(status);
            }
            Ok(Err(e)) => {
                warn!("Error waiting for process {:?}: {}", self.pid, e);
            }
            Err(_) => {
                warn!(
                    "Process {:?} ignored SIGTERM for {:?}, force killing",
                    self.pid, grace
                );
            }
        }

        // Child::kill sends SIGKILL and waits for the exit
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill process {:?}: {}", self.pid, e);
        }
        match self.child.wait().await {
            Ok(status) => {
                info!("Process {:?} killed, status: {}", self.pid, status);
                Some(status)
            }
            Err(e) => {
                warn!("Failed to reap process {:?}: {}", self.pid, e);
                None
            }
        }
    }

    #[cfg(unix)]
    fn signal_terminate(&mut self) {
        let Some(pid) = self.pid else {
            return;
        };
        // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            info!("Sent SIGTERM to process {}", pid);
        } else {
            warn!(
                "SIGTERM to process {} failed: {}",
                pid,
                io::Error::last_os_error()
            );
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&mut self) {
        // No graceful signal outside unix; go straight to kill
        if let Err(e) = self.child.start_kill() {
            warn!("Failed to kill process {:?}: {}", self.pid, e);
        }
    }
}
