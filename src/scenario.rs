//! Capability request scenario
//!
//! Handshake, tool discovery, and optionally one capability request through
//! the server's gateway tool, followed by a check that a freshly built tool
//! shows up in `tools/list`.

use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{Level, info};

use crate::error::ScenarioError;
use crate::io::Transport;
use crate::log_timing;
use crate::session::ProtocolSession;

/// Tool through which capabilities are requested
pub const DEFAULT_GATEWAY_TOOL: &str = "request_capability";

/// Outcome status meaning the tool was built and registered
pub const STATUS_BUILT: &str = "built";

// ============================================================================
// Capability Request
// ============================================================================

/// A tool specification to hand to the gateway tool
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityRequest {
    pub gateway_tool: String,
    /// Specification object passed as the call arguments
    pub spec: Value,
}

impl CapabilityRequest {
    /// The tool spec must be an object with a string `name`
    pub fn new(gateway_tool: impl Into<String>, spec: Value) -> Result<Self, ScenarioError> {
        let has_name = spec.get("name").is_some_and(Value::is_string);
        if !spec.is_object() || !has_name {
            return Err(ScenarioError::SpecShape);
        }
        Ok(Self {
            gateway_tool: gateway_tool.into(),
            spec,
        })
    }

    /// Load the specification from a JSON file
    pub fn from_file(gateway_tool: impl Into<String>, path: &Path) -> Result<Self, ScenarioError> {
        let text = std::fs::read_to_string(path).map_err(|source| ScenarioError::SpecRead {
            path: path.to_path_buf(),
            source,
        })?;
        let spec = serde_json::from_str(&text).map_err(|source| ScenarioError::SpecParse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::new(gateway_tool, spec)
    }

    /// Name of the tool being requested
    pub fn tool_name(&self) -> &str {
        self.spec
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// Application payload found in the first content item of the call result
///
/// Only `status` is promised by the server. Known fields are read leniently:
/// a field with an unexpected type is `None` and stays visible in `extra`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityOutcome {
    pub status: Option<String>,
    pub build_iterations: Option<u64>,
    pub tests_run: Option<u64>,
    pub tests_passed: Option<u64>,
    pub exploits_attempted: Option<u64>,
    pub exploits_succeeded: Option<u64>,
    pub escalated: Option<bool>,
    pub reason: Option<String>,
    pub authorized_by: Option<String>,
    pub evidence_url: Option<String>,
    pub error: Option<String>,
    pub timings: Option<Map<String, Value>>,
    /// Everything else the server sent
    pub extra: Map<String, Value>,
}

impl CapabilityOutcome {
    pub fn from_map(mut map: Map<String, Value>) -> Self {
        let mut take = |key: &str, typed: fn(&Value) -> bool| {
            if map.get(key).is_some_and(typed) {
                map.remove(key)
            } else {
                None
            }
        };

        let status = take("status", Value::is_string);
        let build_iterations = take("build_iterations", Value::is_u64);
        let tests_run = take("tests_run", Value::is_u64);
        let tests_passed = take("tests_passed", Value::is_u64);
        let exploits_attempted = take("exploits_attempted", Value::is_u64);
        let exploits_succeeded = take("exploits_succeeded", Value::is_u64);
        let escalated = take("escalated", Value::is_boolean);
        let reason = take("reason", Value::is_string);
        let authorized_by = take("authorized_by", Value::is_string);
        let evidence_url = take("evidence_url", Value::is_string);
        let timings = take("timings", Value::is_object);
        // Servers report errors either as a string or as `{"message": ...}`
        let error = match map.remove("error") {
            Some(Value::String(message)) => Some(message),
            Some(Value::Object(object)) => {
                let message = object
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Some(message.unwrap_or_else(|| Value::Object(object).to_string()))
            }
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };

        let string = |v: Option<Value>| match v {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };
        Self {
            status: string(status),
            build_iterations: build_iterations.as_ref().and_then(Value::as_u64),
            tests_run: tests_run.as_ref().and_then(Value::as_u64),
            tests_passed: tests_passed.as_ref().and_then(Value::as_u64),
            exploits_attempted: exploits_attempted.as_ref().and_then(Value::as_u64),
            exploits_succeeded: exploits_succeeded.as_ref().and_then(Value::as_u64),
            escalated: escalated.as_ref().and_then(Value::as_bool),
            reason: string(reason),
            authorized_by: string(authorized_by),
            evidence_url: string(evidence_url),
            error,
            timings: match timings {
                Some(Value::Object(timings)) => Some(timings),
                _ => None,
            },
            extra: map,
        }
    }

    pub fn is_built(&self) -> bool {
        self.status.as_deref() == Some(STATUS_BUILT)
    }

    /// Milliseconds recorded for one pipeline stage, e.g. `architect_ms`
    pub fn timing_ms(&self, stage: &str) -> Option<u64> {
        self.timings.as_ref()?.get(stage)?.as_u64()
    }
}

/// How the call result text was interpreted
#[derive(Debug, Clone, PartialEq)]
pub enum CallPayload {
    /// JSON object, decoded
    Outcome(Box<CapabilityOutcome>),
    /// Text that is not a JSON object
    Raw(String),
    /// No content, or content without text
    Empty,
}

impl CallPayload {
    pub fn from_text(text: Option<&str>) -> Self {
        let Some(text) = text else {
            return CallPayload::Empty;
        };
        match serde_json::from_str::<Map<String, Value>>(text) {
            Ok(map) => CallPayload::Outcome(Box::new(CapabilityOutcome::from_map(map))),
            Err(_) => CallPayload::Raw(text.to_string()),
        }
    }

    pub fn outcome(&self) -> Option<&CapabilityOutcome> {
        match self {
            CallPayload::Outcome(outcome) => Some(outcome),
            _ => None,
        }
    }
}

/// Result of the capability request phase
#[derive(Debug, Clone, PartialEq)]
pub struct CallReport {
    pub tool_name: String,
    pub elapsed: Duration,
    pub is_error: bool,
    pub payload: CallPayload,
    /// Tool names listed after a successful build
    pub tools_after: Option<Vec<String>>,
}

impl CallReport {
    /// Whether the built tool appears in the follow-up listing
    pub fn tool_registered(&self) -> Option<bool> {
        self.tools_after
            .as_ref()
            .map(|tools| tools.iter().any(|t| *t == self.tool_name))
    }
}

/// Everything the scenario observed
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioReport {
    pub peer_name: String,
    pub tools: Vec<String>,
    pub call: Option<CallReport>,
}

// ============================================================================
// Driver
// ============================================================================

/// Run the scenario over an already started transport
///
/// Without a request only the handshake and discovery run. The caller owns
/// cleanup of the transport on every path.
pub async fn run<T: Transport>(
    session: &mut ProtocolSession<T>,
    request: Option<&CapabilityRequest>,
) -> Result<ScenarioReport, ScenarioError> {
    session.initialize().await?;
    let peer_name = session.peer_name().to_string();

    let tools = tool_names(session).await?;
    info!("Available tools: {:?}", tools);

    let Some(request) = request else {
        return Ok(ScenarioReport {
            peer_name,
            tools,
            call: None,
        });
    };

    if !tools.iter().any(|t| *t == request.gateway_tool) {
        return Err(ScenarioError::MissingGatewayTool {
            tool: request.gateway_tool.clone(),
            available: tools,
        });
    }

    info!(
        gateway = %request.gateway_tool,
        tool = request.tool_name(),
        "Requesting capability"
    );
    let started = Instant::now();
    let result = session
        .call_tool(&request.gateway_tool, request.spec.clone())
        .await?;
    let elapsed = started.elapsed();
    log_timing!(Level::INFO, "capability_request", elapsed);

    let payload = CallPayload::from_text(result.first_text());

    let tools_after = match payload.outcome() {
        Some(outcome) if outcome.is_built() => Some(tool_names(session).await?),
        _ => None,
    };

    Ok(ScenarioReport {
        peer_name,
        tools,
        call: Some(CallReport {
            tool_name: request.tool_name().to_string(),
            elapsed,
            is_error: result.is_error,
            payload,
            tools_after,
        }),
    })
}

async fn tool_names<T: Transport>(
    session: &mut ProtocolSession<T>,
) -> Result<Vec<String>, ScenarioError> {
    Ok(session
        .list_tools()
        .await?
        .into_iter()
        .map(|tool| tool.name)
        .collect())
}

// ============================================================================
// Report Rendering
// ============================================================================

fn opt<T: fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map_or_else(|| "-".to_string(), ToString::to_string)
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Connected to: {}", self.peer_name)?;
        writeln!(f, "Available tools: {:?}", self.tools)?;

        let Some(call) = &self.call else {
            return Ok(());
        };

        writeln!(
            f,
            "Response for {} ({:.1}s){}:",
            call.tool_name,
            call.elapsed.as_secs_f64(),
            if call.is_error { " [isError]" } else { "" }
        )?;

        match &call.payload {
            CallPayload::Empty => writeln!(f, "  (no text content)")?,
            CallPayload::Raw(text) => writeln!(f, "  raw: {}", text)?,
            CallPayload::Outcome(outcome) => {
                writeln!(f, "  status           : {}", opt(&outcome.status))?;
                match outcome.status.as_deref() {
                    Some(STATUS_BUILT) => {
                        writeln!(f, "  build_iterations : {}", opt(&outcome.build_iterations))?;
                        writeln!(
                            f,
                            "  tests            : {}/{}",
                            opt(&outcome.tests_passed),
                            opt(&outcome.tests_run)
                        )?;
                        writeln!(
                            f,
                            "  exploits blocked : {} attempted, {} succeeded",
                            opt(&outcome.exploits_attempted),
                            opt(&outcome.exploits_succeeded)
                        )?;
                        if let Some(escalated) = outcome.escalated {
                            writeln!(f, "  escalated        : {}", escalated)?;
                        }
                        if outcome.timings.is_some() {
                            writeln!(
                                f,
                                "  architect        : {}ms",
                                opt(&outcome.timing_ms("architect_ms"))
                            )?;
                            writeln!(
                                f,
                                "  planner          : {}ms",
                                opt(&outcome.timing_ms("planner_ms"))
                            )?;
                        }
                    }
                    Some("denied") => {
                        writeln!(f, "  reason           : {}", opt(&outcome.reason))?;
                        writeln!(f, "  authorized_by    : {}", opt(&outcome.authorized_by))?;
                        writeln!(f, "  evidence         : {}", opt(&outcome.evidence_url))?;
                    }
                    _ => {
                        if let Some(error) = &outcome.error {
                            writeln!(f, "  error            : {}", error)?;
                        }
                        for (key, value) in &outcome.extra {
                            writeln!(f, "  {:<17}: {}", key, value)?;
                        }
                    }
                }
            }
        }

        match (call.tool_registered(), &call.tools_after) {
            (Some(true), Some(tools)) => writeln!(f, "Registered: yes, tools/list: {:?}", tools)?,
            (Some(false), Some(tools)) => writeln!(f, "Registered: NO, tools/list: {:?}", tools)?,
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::StdioClient;
    use crate::io::transport::MockTransport;
    use crate::protocol::jsonrpc::success_response;
    use crate::session::SessionConfig;
    use crate::test_utils::{mock_server, response_line};
    use serde_json::json;
    use std::io::Write;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            settle_delay: Duration::from_millis(10),
            call_timeout: Duration::from_secs(10),
            ..SessionConfig::default()
        }
    }

    fn spec() -> CapabilityRequest {
        CapabilityRequest::new(
            DEFAULT_GATEWAY_TOOL,
            json!({
                "name": "add_two_numbers",
                "inputs": {"a": "number", "b": "number"},
                "outputs": {"result": "number"}
            }),
        )
        .unwrap()
    }

    fn listing(names: &[&str]) -> Value {
        json!({"tools": names.iter().map(|n| json!({"name": n})).collect::<Vec<_>>()})
    }

    fn text_result(text: &str) -> Value {
        json!({"content": [{"type": "text", "text": text}]})
    }

    /// Mock server script answering each request line in order
    fn scripted_server(replies: &[String]) -> String {
        let mut script = String::from("read -r init\n");
        let mut replies = replies.iter();
        if let Some(init) = replies.next() {
            script.push_str(&format!("printf '%s\\n' '{init}'\nread -r initialized\n"));
        }
        for reply in replies {
            script.push_str(&format!("read -r req\nprintf '%s\\n' '{reply}'\n"));
        }
        script.push_str("exec sleep 30\n");
        script
    }

    #[test]
    fn test_capability_request_requires_named_object() {
        assert!(CapabilityRequest::new("g", json!({"name": "x"})).is_ok());
        assert!(matches!(
            CapabilityRequest::new("g", json!({"description": "x"})),
            Err(ScenarioError::SpecShape)
        ));
        assert!(matches!(
            CapabilityRequest::new("g", json!(["name"])),
            Err(ScenarioError::SpecShape)
        ));
    }

    #[test]
    fn test_capability_request_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"name": "signal_send", "constraints": {{"network": []}}}}"#).unwrap();

        let request = CapabilityRequest::from_file("request_capability", file.path()).unwrap();
        assert_eq!(request.tool_name(), "signal_send");
        assert_eq!(request.spec["constraints"]["network"], json!([]));

        let missing = CapabilityRequest::from_file("g", Path::new("/nonexistent/spec.json"));
        assert!(matches!(missing, Err(ScenarioError::SpecRead { .. })));

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(bad, "{{not json").unwrap();
        assert!(matches!(
            CapabilityRequest::from_file("g", bad.path()),
            Err(ScenarioError::SpecParse { .. })
        ));
    }

    #[test]
    fn test_payload_interpretation() {
        assert_eq!(CallPayload::from_text(None), CallPayload::Empty);
        assert_eq!(
            CallPayload::from_text(Some("plain words")),
            CallPayload::Raw("plain words".to_string())
        );

        let payload = CallPayload::from_text(Some(
            r#"{"status":"denied","reason":"privacy","authorized_by":"ops","queue":3}"#,
        ));
        let outcome = payload.outcome().unwrap();
        assert_eq!(outcome.status.as_deref(), Some("denied"));
        assert_eq!(outcome.reason.as_deref(), Some("privacy"));
        assert_eq!(outcome.extra["queue"], json!(3));
        assert!(!outcome.is_built());
    }

    #[test]
    fn test_mistyped_field_keeps_status() {
        let payload = CallPayload::from_text(Some(
            r#"{"status":"built","escalated":"no","build_iterations":1}"#,
        ));
        let outcome = payload.outcome().unwrap();
        assert!(outcome.is_built());
        assert_eq!(outcome.build_iterations, Some(1));
        assert_eq!(outcome.escalated, None);
        assert_eq!(outcome.extra["escalated"], json!("no"));
    }

    #[test]
    fn test_structured_error_message() {
        let payload = CallPayload::from_text(Some(
            r#"{"status":"approval_failed","error":{"message":"discord down"}}"#,
        ));
        let outcome = payload.outcome().unwrap();
        assert_eq!(outcome.status.as_deref(), Some("approval_failed"));
        assert_eq!(outcome.error.as_deref(), Some("discord down"));

        let payload = CallPayload::from_text(Some(r#"{"status":7,"error":{"code":3}}"#));
        let outcome = payload.outcome().unwrap();
        assert_eq!(outcome.status, None);
        assert_eq!(outcome.error.as_deref(), Some(r#"{"code":3}"#));
        assert_eq!(outcome.extra["status"], json!(7));
    }

    #[test]
    fn test_json_that_is_not_an_object_is_raw() {
        assert_eq!(
            CallPayload::from_text(Some("[1,2]")),
            CallPayload::Raw("[1,2]".to_string())
        );
    }

    #[test]
    fn test_built_report_includes_timings() {
        let text = r#"{"status":"built","tests_run":2,"tests_passed":2,"timings":{"architect_ms":1200,"planner_ms":"slow"}}"#;
        let report = ScenarioReport {
            peer_name: "girt".to_string(),
            tools: vec!["request_capability".to_string()],
            call: Some(CallReport {
                tool_name: "add_two_numbers".to_string(),
                elapsed: Duration::from_millis(1500),
                is_error: false,
                payload: CallPayload::from_text(Some(text)),
                tools_after: None,
            }),
        };

        let rendered = report.to_string();
        assert!(rendered.contains("architect        : 1200ms"));
        assert!(rendered.contains("planner          : -ms"));
        assert!(rendered.contains("tests            : 2/2"));
    }

    #[tokio::test]
    async fn test_built_with_mistyped_field_still_verifies_registration() {
        let transport = MockTransport::with_replies(vec![
            success_response(1, json!({"serverInfo": {"name": "girt"}})),
            success_response(2, listing(&["request_capability"])),
            success_response(3, text_result(r#"{"status":"built","escalated":"no"}"#)),
            success_response(4, listing(&["request_capability", "add_two_numbers"])),
        ]);
        let mut session = ProtocolSession::new(transport, fast_config());

        let report = run(&mut session, Some(&spec())).await.unwrap();
        assert_eq!(report.call.unwrap().tool_registered(), Some(true));
    }

    #[tokio::test]
    async fn test_handshake_only_without_request() {
        let transport = MockTransport::with_replies(vec![
            success_response(1, json!({"serverInfo": {"name": "girt"}})),
            success_response(2, listing(&["request_capability"])),
        ]);
        let mut session = ProtocolSession::new(transport, fast_config());

        let report = run(&mut session, None).await.unwrap();
        assert_eq!(report.peer_name, "girt");
        assert_eq!(report.tools, vec!["request_capability"]);
        assert!(report.call.is_none());
    }

    #[tokio::test]
    async fn test_missing_gateway_tool_fails() {
        let transport = MockTransport::with_replies(vec![
            success_response(1, json!({"serverInfo": {"name": "girt"}})),
            success_response(2, listing(&["echo"])),
        ]);
        let mut session = ProtocolSession::new(transport, fast_config());

        match run(&mut session, Some(&spec())).await {
            Err(ScenarioError::MissingGatewayTool { tool, available }) => {
                assert_eq!(tool, "request_capability");
                assert_eq!(available, vec!["echo"]);
            }
            other => panic!("expected missing gateway tool, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_built_outcome_triggers_follow_up_listing() {
        let outcome = json!({
            "status": "built",
            "build_iterations": 2,
            "tests_run": 5,
            "tests_passed": 5,
            "exploits_attempted": 3,
            "exploits_succeeded": 0
        });
        let transport = MockTransport::with_replies(vec![
            success_response(1, json!({"serverInfo": {"name": "girt"}})),
            success_response(2, listing(&["request_capability"])),
            success_response(3, text_result(&outcome.to_string())),
            success_response(4, listing(&["request_capability", "add_two_numbers"])),
        ]);
        let sent = transport.sent_handle();
        let mut session = ProtocolSession::new(transport, fast_config());

        let report = run(&mut session, Some(&spec())).await.unwrap();
        let call = report.call.as_ref().unwrap();
        assert!(call.payload.outcome().unwrap().is_built());
        assert_eq!(call.tool_registered(), Some(true));

        let call_params = sent.lock().unwrap()[3].clone();
        match call_params {
            crate::protocol::JsonRpcMessage::Request(request) => {
                assert_eq!(request.method, "tools/call");
                let params = request.params.unwrap();
                assert_eq!(params["name"], "request_capability");
                assert_eq!(params["arguments"]["name"], "add_two_numbers");
            }
            other => panic!("expected tools/call request, got {other:?}"),
        }

        let rendered = report.to_string();
        assert!(rendered.contains("Connected to: girt"));
        assert!(rendered.contains("tests            : 5/5"));
        assert!(rendered.contains("Registered: yes"));
    }

    #[tokio::test]
    async fn test_end_to_end_handshake_with_missing_tools() {
        let script = scripted_server(&[
            response_line(1, json!({"serverInfo": {"name": "mock"}})),
            response_line(2, json!({})),
        ]);
        let client = StdioClient::launch(mock_server(&script)).await.unwrap();
        let mut session = ProtocolSession::new(client, fast_config());

        let report = run(&mut session, None).await;
        session.into_transport().stop().await;

        let report = report.unwrap();
        assert_eq!(report.peer_name, "mock");
        assert!(report.tools.is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end_call_with_empty_content_list() {
        let script = scripted_server(&[
            response_line(1, json!({"serverInfo": {"name": "mock"}})),
            response_line(2, listing(&["request_capability"])),
            response_line(3, json!({"content": []})),
        ]);
        let client = StdioClient::launch(mock_server(&script)).await.unwrap();
        let mut session = ProtocolSession::new(client, fast_config());

        let report = run(&mut session, Some(&spec())).await;
        session.into_transport().stop().await;

        let call = report.unwrap().call.unwrap();
        assert_eq!(call.payload, CallPayload::Empty);
        assert_eq!(call.tools_after, None);
        assert!(!call.is_error);
    }

    #[tokio::test]
    async fn test_end_to_end_server_exits_mid_call() {
        let script = format!(
            "read -r init\nprintf '%s\\n' '{}'\nread -r n\nread -r list\nprintf '%s\\n' '{}'\nread -r call\necho 'panic: out of fuel' >&2\nexit 1\n",
            response_line(1, json!({"serverInfo": {"name": "mock"}})),
            response_line(2, listing(&["request_capability"])),
        );
        let client = StdioClient::launch(mock_server(&script)).await.unwrap();
        let mut session = ProtocolSession::new(client, fast_config());

        let result = run(&mut session, Some(&spec())).await;
        let mut client = session.into_transport();
        let status = client.stop().await;

        assert!(matches!(
            result,
            Err(ScenarioError::Session(crate::error::SessionError::Client(
                crate::error::ClientError::ConnectionClosed
            )))
        ));
        assert_eq!(status.and_then(|s| s.code()), Some(1));
        assert_eq!(client.stderr_tail(20), vec!["panic: out of fuel"]);
    }
}
