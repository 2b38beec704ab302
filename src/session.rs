//! MCP protocol session
//!
//! Drives a [`Transport`] through the MCP handshake and tool calls. Requests
//! are strictly sequential: one request is sent, then messages are received
//! until its response arrives or the per-call bound runs out.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{Level, debug, info, warn};

use crate::error::{ClientError, SessionError};
use crate::io::Transport;
use crate::log_timing;
use crate::protocol::JsonRpcMessage;
use crate::protocol::jsonrpc::{self, error_codes};
use crate::protocol::mcp::{
    CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    ListToolsResult, ToolDescriptor, methods,
};

/// Peer name reported when the server does not advertise one
pub const UNKNOWN_PEER: &str = "?";

/// Timeouts and identity used by a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub client_info: Implementation,
    pub initialize_timeout: Duration,
    pub list_timeout: Duration,
    pub call_timeout: Duration,
    /// Pause after `notifications/initialized` for servers that do not pipeline
    pub settle_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_info: Implementation::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            initialize_timeout: Duration::from_secs(15),
            list_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(360),
            settle_delay: Duration::from_millis(200),
        }
    }
}

/// Sequential MCP client session over any transport
pub struct ProtocolSession<T: Transport> {
    transport: T,
    config: SessionConfig,
    next_id: i64,
    server: Option<InitializeResult>,
}

impl<T: Transport> ProtocolSession<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            next_id: 1,
            server: None,
        }
    }

    /// Give the transport back, e.g. to stop it
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Name the server advertised during `initialize`
    pub fn peer_name(&self) -> &str {
        self.server
            .as_ref()
            .and_then(InitializeResult::server_name)
            .unwrap_or(UNKNOWN_PEER)
    }

    /// Run the handshake: `initialize`, then `notifications/initialized`
    pub async fn initialize(&mut self) -> Result<&InitializeResult, SessionError> {
        let params = InitializeParams::new(self.config.client_info.clone());
        let timeout = self.config.initialize_timeout;

        let result: InitializeResult = self.call(methods::INITIALIZE, &params, timeout).await?;
        info!(
            server = result.server_name().unwrap_or(UNKNOWN_PEER),
            protocol = ?result.protocol_version,
            capabilities = ?result.capabilities,
            "Connected to server"
        );

        self.notify(methods::INITIALIZED, Value::Object(Default::default()))
            .await?;
        // The initialized notification gets no reply; give the server a
        // moment before the next request
        tokio::time::sleep(self.config.settle_delay).await;

        Ok(self.server.insert(result))
    }

    /// `tools/list`; a reply without `tools` is an empty list
    pub async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, SessionError> {
        let timeout = self.config.list_timeout;
        let result: ListToolsResult = self
            .call(methods::TOOLS_LIST, &Value::Object(Default::default()), timeout)
            .await?;
        debug!("Server lists {} tools", result.tools.len());
        Ok(result.tools)
    }

    /// `tools/call` with the configured call timeout
    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, SessionError> {
        let timeout = self.config.call_timeout;
        self.call_tool_with_timeout(name, arguments, timeout).await
    }

    pub async fn call_tool_with_timeout(
        &mut self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<CallToolResult, SessionError> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let result: CallToolResult = self.call(methods::TOOLS_CALL, &params, timeout).await?;
        if result.is_error {
            warn!(tool = name, "Tool call returned isError");
        }
        Ok(result)
    }

    /// Send a one-way notification
    pub async fn notify(&mut self, method: &str, params: Value) -> Result<(), SessionError> {
        self.transport
            .send(&jsonrpc::notification(method, Some(params)))
            .await?;
        Ok(())
    }

    /// Send a request and decode its result into `R`
    ///
    /// A missing or null result decodes as `R::default()`.
    pub async fn call<P, R>(
        &mut self,
        method: &str,
        params: &P,
        timeout: Duration,
    ) -> Result<R, SessionError>
    where
        P: serde::Serialize,
        R: DeserializeOwned + Default,
    {
        let params = serde_json::to_value(params).map_err(|source| SessionError::Params {
            method: method.to_string(),
            source,
        })?;

        match self.request(method, params, timeout).await? {
            None | Some(Value::Null) => Ok(R::default()),
            Some(result) => {
                serde_json::from_value(result).map_err(|source| SessionError::UnexpectedResult {
                    method: method.to_string(),
                    source,
                })
            }
        }
    }

    /// Send a request and wait for the matching response
    ///
    /// Server notifications and server-to-client requests arriving in the
    /// meantime are logged and skipped. The bound covers the whole wait.
    pub async fn request(
        &mut self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Option<Value>, SessionError> {
        let id = self.next_id;
        self.next_id += 1;

        self.transport
            .send(&jsonrpc::request(id, method, Some(params)))
            .await?;

        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = match self.transport.receive(remaining).await {
                Ok(message) => message,
                Err(ClientError::Timeout { .. }) => {
                    return Err(ClientError::Timeout { after: timeout }.into());
                }
                Err(e) => return Err(e.into()),
            };

            match message {
                JsonRpcMessage::Response(response) => {
                    log_timing!(Level::DEBUG, method, started.elapsed());
                    if let Some(error) = response.error {
                        return Err(SessionError::Rpc {
                            method: method.to_string(),
                            code: error.code,
                            kind: error_codes::describe(error.code),
                            message: error.message,
                            data: error.data,
                        });
                    }
                    return Ok(response.result);
                }
                JsonRpcMessage::Notification(notification) => {
                    debug!(
                        method = %notification.method,
                        "Skipping server notification while waiting for {}", method
                    );
                }
                JsonRpcMessage::Request(request) => {
                    warn!(
                        method = %request.method,
                        id = %request.id,
                        "Ignoring server request while waiting for {}", method
                    );
                }
            }
        }
    }
}
