//! Probe configuration
//!
//! CLI arguments and environment are resolved into a [`ProbeConfig`], which
//! hands out the pieces each layer needs: the process spec for the transport
//! client, the timeouts for the session, and the optional capability request.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, ScenarioError};
use crate::io::transport::{DEFAULT_STDERR_CAPACITY, DEFAULT_STOP_GRACE};
use crate::io::{ClientConfig, ProcessSpec};
use crate::protocol::mcp::Implementation;
use crate::scenario::{CapabilityRequest, DEFAULT_GATEWAY_TOOL};
use crate::session::SessionConfig;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Environment variable naming the server executable
pub const SERVER_BIN_ENV: &str = "GIRT_BIN";

/// Environment variable naming the server's config file
pub const SERVER_CONFIG_ENV: &str = "GIRT_CONFIG";

/// Environment variable the server reads its log filter from
pub const CHILD_LOG_ENV: &str = "GIRT_LOG";

/// Server config passed when neither `--config` nor `GIRT_CONFIG` is given
pub const DEFAULT_SERVER_CONFIG: &str = "girt.toml";

/// Server executable relative to `$HOME` when nothing else is given
pub const DEFAULT_SERVER_RELATIVE: &str = ".cargo/bin/girt";

/// Default timeout for `initialize` (15 seconds)
///
/// Covers server startup, which may compile or load its tool registry.
pub const DEFAULT_INITIALIZE_TIMEOUT_SECS: u64 = 15;

/// Default timeout for `tools/list` (10 seconds)
pub const DEFAULT_LIST_TIMEOUT_SECS: u64 = 10;

/// Default timeout for `tools/call` (6 minutes)
///
/// A capability request runs a full build and test pipeline on the server.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 360;

/// Maximum allowed timeout for any single request (30 minutes)
pub const MAX_REQUEST_TIMEOUT_SECS: u64 = 1800;

/// Pause after `notifications/initialized`
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 200;

/// Number of stderr lines printed when the probe fails
pub const DEFAULT_STDERR_TAIL_LINES: usize = 20;

// ============================================================================
// Resolution Helpers
// ============================================================================

/// Resolve the server executable
///
/// Priority: CLI argument, then `GIRT_BIN`, then `$HOME/.cargo/bin/girt`.
pub fn resolve_server_path(
    cli: Option<PathBuf>,
    env_bin: Option<String>,
    home: Option<String>,
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = cli {
        return Ok(path);
    }
    if let Some(path) = env_bin.filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    home.filter(|h| !h.is_empty())
        .map(|home| Path::new(&home).join(DEFAULT_SERVER_RELATIVE))
        .ok_or(ConfigError::NoDefaultServer)
}

/// Split a `KEY=VALUE` assignment; the value may itself contain `=`
pub fn parse_env_pair(pair: &str) -> Result<(String, String), ConfigError> {
    match pair.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(ConfigError::InvalidEnvPair(pair.to_string())),
    }
}

// ============================================================================
// Probe Configuration
// ============================================================================

/// Complete probe configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    /// Server executable
    pub server: PathBuf,

    /// Always passed to the server as `--config <path>`
    pub server_config: PathBuf,

    /// Additional server arguments, after `--config`
    pub server_args: Vec<String>,

    /// Extra environment for the server
    pub env: Vec<(String, String)>,

    /// Tool specification for the capability request; handshake only when absent
    pub spec_path: Option<PathBuf>,

    pub gateway_tool: String,

    /// Wait between launch and the first message
    pub startup_delay: Duration,

    pub initialize_timeout: Duration,
    pub list_timeout: Duration,
    pub call_timeout: Duration,
    pub settle_delay: Duration,
    pub stop_grace: Duration,

    /// Stderr lines retained from the server
    pub stderr_capacity: usize,

    /// Stderr lines printed on failure
    pub stderr_tail_lines: usize,
}

impl ProbeConfig {
    /// Configuration with defaults for everything but the executable
    pub fn new(server: impl Into<PathBuf>) -> Self {
        Self {
            server: server.into(),
            server_config: PathBuf::from(DEFAULT_SERVER_CONFIG),
            server_args: Vec::new(),
            env: Vec::new(),
            spec_path: None,
            gateway_tool: DEFAULT_GATEWAY_TOOL.to_string(),
            startup_delay: Duration::ZERO,
            initialize_timeout: Duration::from_secs(DEFAULT_INITIALIZE_TIMEOUT_SECS),
            list_timeout: Duration::from_secs(DEFAULT_LIST_TIMEOUT_SECS),
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            stop_grace: DEFAULT_STOP_GRACE,
            stderr_capacity: DEFAULT_STDERR_CAPACITY,
            stderr_tail_lines: DEFAULT_STDERR_TAIL_LINES,
        }
    }

    /// Override the default server config; `None` keeps it
    pub fn with_server_config(mut self, path: Option<PathBuf>) -> Self {
        if let Some(path) = path {
            self.server_config = path;
        }
        self
    }

    pub fn with_server_args(mut self, args: Vec<String>) -> Self {
        self.server_args = args;
        self
    }

    /// Add a `KEY=VALUE` assignment for the server's environment
    pub fn with_env_pair(mut self, pair: &str) -> Result<Self, ConfigError> {
        self.env.push(parse_env_pair(pair)?);
        Ok(self)
    }

    /// Set the server's log filter
    pub fn with_child_log(mut self, filter: Option<String>) -> Self {
        if let Some(filter) = filter {
            self.env.push((CHILD_LOG_ENV.to_string(), filter));
        }
        self
    }

    pub fn with_spec(mut self, path: Option<PathBuf>) -> Self {
        self.spec_path = path;
        self
    }

    pub fn with_gateway_tool(mut self, tool: impl Into<String>) -> Self {
        self.gateway_tool = tool.into();
        self
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max = Duration::from_secs(MAX_REQUEST_TIMEOUT_SECS);
        for (name, timeout) in [
            ("initialize", self.initialize_timeout),
            ("tools/list", self.list_timeout),
            ("tools/call", self.call_timeout),
        ] {
            if timeout.is_zero() {
                return Err(ConfigError::ZeroTimeout { name });
            }
            if timeout > max {
                return Err(ConfigError::TimeoutTooLong {
                    name,
                    actual: timeout,
                    max,
                });
            }
        }

        if self.stderr_capacity == 0 {
            return Err(ConfigError::ZeroStderrCapacity);
        }

        if self.gateway_tool.trim().is_empty() {
            return Err(ConfigError::EmptyGatewayTool);
        }

        Ok(())
    }

    /// Command line and environment of the server
    pub fn process_spec(&self) -> ProcessSpec {
        let mut spec = ProcessSpec::new(&self.server)
            .with_arg("--config")
            .with_arg(self.server_config.to_string_lossy())
            .with_args(self.server_args.iter().cloned());
        for (key, value) in &self.env {
            spec = spec.with_env(key, value);
        }
        spec
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(self.process_spec())
            .with_stop_grace(self.stop_grace)
            .with_stderr_capacity(self.stderr_capacity)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            client_info: Implementation::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            initialize_timeout: self.initialize_timeout,
            list_timeout: self.list_timeout,
            call_timeout: self.call_timeout,
            settle_delay: self.settle_delay,
        }
    }

    /// Load the capability request, if a spec file was given
    pub fn capability_request(&self) -> Result<Option<CapabilityRequest>, ScenarioError> {
        self.spec_path
            .as_deref()
            .map(|path| CapabilityRequest::from_file(self.gateway_tool.clone(), path))
            .transpose()
    }
}
