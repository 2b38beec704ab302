//! Error types for the probe
//!
//! Each layer has its own error enum; outer layers wrap inner ones with
//! `#[from]` so the original cause is preserved up to `main`.

use std::path::PathBuf;
use std::time::Duration;

use crate::io::process::ProcessError;
use crate::protocol::RequestId;

// ============================================================================
// Transport Client Errors
// ============================================================================

/// Failures of the stdio transport client
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The child could not be started
    #[error("Failed to launch server: {0}")]
    Launch(#[source] ProcessError),

    /// The child's stdin is closed or the child is gone
    #[error("Failed to write to server stdin: {0}")]
    Write(#[source] std::io::Error),

    /// A line could not be accepted as the expected message
    #[error("Protocol error: {violation} (raw: {raw})")]
    Protocol {
        raw: String,
        violation: ProtocolViolation,
    },

    /// Nothing arrived within the caller's bound
    #[error("No response within {after:?}")]
    Timeout { after: Duration },

    /// The child closed stdout; no further replies can arrive
    #[error("Server closed its stdout")]
    ConnectionClosed,

    /// Operation called in the wrong lifecycle state
    #[error("Invalid client state: current={current}, expected={expected}")]
    InvalidState {
        current: &'static str,
        expected: &'static str,
    },

    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether the error is a protocol error of any kind
    pub fn is_protocol(&self) -> bool {
        matches!(self, ClientError::Protocol { .. })
    }
}

/// What exactly was wrong with a received line
#[derive(Debug, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("malformed message: {0}")]
    Malformed(#[from] crate::protocol::jsonrpc::MessageError),

    #[error("response id {} does not match pending request id {expected}", display_id(.received))]
    IdMismatch {
        expected: RequestId,
        received: Option<RequestId>,
    },

    #[error("response id {} arrived with no request pending", display_id(.received))]
    Unsolicited { received: Option<RequestId> },
}

fn display_id(id: &Option<RequestId>) -> String {
    id.as_ref()
        .map_or_else(|| "null".to_string(), ToString::to_string)
}

// ============================================================================
// Protocol Session Errors
// ============================================================================

/// Failures while driving the MCP handshake and tool calls
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The server answered with a JSON-RPC error object
    #[error("{method} failed with JSON-RPC error {code} ({kind}): {message}")]
    Rpc {
        method: String,
        code: i32,
        kind: &'static str,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The result did not have the shape the method promises
    #[error("Unexpected {method} result: {source}")]
    UnexpectedResult {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode {method} params: {source}")]
    Params {
        method: String,
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// Scenario Errors
// ============================================================================

/// Failures of the capability-request scenario
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Server does not advertise {tool}; available tools: {available:?}")]
    MissingGatewayTool {
        tool: String,
        available: Vec<String>,
    },

    #[error("Failed to read tool spec {path}: {source}")]
    SpecRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse tool spec {path}: {source}")]
    SpecParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Tool spec must be a JSON object with a string \"name\"")]
    SpecShape,
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Configuration validation errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} timeout must be greater than zero")]
    ZeroTimeout { name: &'static str },

    #[error("{name} timeout {actual:?} exceeds maximum {max:?}")]
    TimeoutTooLong {
        name: &'static str,
        actual: Duration,
        max: Duration,
    },

    #[error("Invalid environment assignment {0:?}, expected KEY=VALUE")]
    InvalidEnvPair(String),

    #[error("Stderr log capacity must be greater than zero")]
    ZeroStderrCapacity,

    #[error("Gateway tool name must not be empty")]
    EmptyGatewayTool,

    #[error("Cannot resolve default server path: HOME is not set; pass --server")]
    NoDefaultServer,
}
