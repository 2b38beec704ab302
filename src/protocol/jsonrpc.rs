//! JSON-RPC 2.0 message types
//!
//! Provides the wire data model, constants and builders for JSON-RPC 2.0
//! as per https://www.jsonrpc.org/specification

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ============================================================================
// JSON-RPC 2.0 Constants
// ============================================================================

/// JSON-RPC 2.0 version identifier
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 Error Codes (as per JSON-RPC specification)
/// https://www.jsonrpc.org/specification#error_object
pub mod error_codes {
    /// Parse error - Invalid JSON was received by the server.
    pub const PARSE_ERROR: i32 = -32700;

    /// Invalid Request - The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;

    /// Method not found - The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;

    /// Invalid params - Invalid method parameter(s).
    pub const INVALID_PARAMS: i32 = -32602;

    /// Internal error - Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;

    /// Human readable name of a code, for logs and reports
    pub fn describe(code: i32) -> &'static str {
        match code {
            PARSE_ERROR => "parse error",
            INVALID_REQUEST => "invalid request",
            METHOD_NOT_FOUND => "method not found",
            INVALID_PARAMS => "invalid params",
            INTERNAL_ERROR => "internal error",
            -32099..=-32000 => "server error",
            _ => "application error",
        }
    }
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

// ============================================================================
// JSON-RPC Types
// ============================================================================

/// Request identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

/// JSON-RPC 2.0 request message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    #[serde(default = "default_version")]
    pub jsonrpc: String,

    /// Request identifier
    pub id: RequestId,

    /// Method name
    pub method: String,

    /// Optional parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 notification message (no response expected)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// JSON-RPC version (always "2.0")
    #[serde(default = "default_version")]
    pub jsonrpc: String,

    /// Method name
    pub method: String,

    /// Optional parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0")
    #[serde(default = "default_version")]
    pub jsonrpc: String,

    /// Request identifier; null when the peer could not determine it
    pub id: Option<RequestId>,

    /// Result (present if successful, may be JSON null)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error (present if failed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    /// Error code
    pub code: i32,

    /// Error message
    pub message: String,

    /// Optional additional data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any message that can travel over the wire
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

/// Why a line could not be read as a JSON-RPC message
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("object has neither method nor result/error")]
    Unrecognized,
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl JsonRpcMessage {
    /// Parse one wire line
    pub fn parse(line: &str) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_str(line.trim())?;
        Self::from_value(value)
    }

    /// Classify a JSON value as request, notification or response
    ///
    /// Anything with a `method` is a request when it carries a non-null `id`
    /// and a notification otherwise. Anything with `result` or `error` is a
    /// response; an explicit `"result": null` is kept as `Some(Value::Null)`.
    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        let mut object = match value {
            Value::Object(object) => object,
            other => return Err(MessageError::NotAnObject(kind_of(&other))),
        };

        if object.contains_key("method") {
            let has_id = object.get("id").is_some_and(|id| !id.is_null());
            if !has_id {
                object.remove("id");
                return Ok(JsonRpcMessage::Notification(serde_json::from_value(
                    Value::Object(object),
                )?));
            }
            return Ok(JsonRpcMessage::Request(serde_json::from_value(
                Value::Object(object),
            )?));
        }

        if object.contains_key("result") || object.contains_key("error") {
            return Ok(JsonRpcMessage::Response(Self::response_from_object(
                object,
            )?));
        }

        Err(MessageError::Unrecognized)
    }

    fn response_from_object(
        mut object: Map<String, Value>,
    ) -> Result<JsonRpcResponse, MessageError> {
        let jsonrpc = match object.remove("jsonrpc") {
            Some(Value::String(version)) => version,
            _ => default_version(),
        };
        let id = match object.remove("id") {
            None | Some(Value::Null) => None,
            Some(id) => Some(serde_json::from_value(id)?),
        };
        let error = match object.remove("error") {
            None | Some(Value::Null) => None,
            Some(error) => Some(serde_json::from_value(error)?),
        };

        Ok(JsonRpcResponse {
            jsonrpc,
            id,
            result: object.remove("result"),
            error,
        })
    }

    /// Serialize to compact JSON (no line terminator)
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.method),
            JsonRpcMessage::Notification(n) => Some(&n.method),
            JsonRpcMessage::Response(_) => None,
        }
    }

    /// Identifier of a request or response
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.id),
            JsonRpcMessage::Response(r) => r.id.as_ref(),
            JsonRpcMessage::Notification(_) => None,
        }
    }

    pub fn into_response(self) -> Option<JsonRpcResponse> {
        match self {
            JsonRpcMessage::Response(response) => Some(response),
            _ => None,
        }
    }
}

// ============================================================================
// JSON-RPC Message Builders
// ============================================================================

/// Create a request expecting a reply
pub fn request(id: impl Into<RequestId>, method: &str, params: Option<Value>) -> JsonRpcMessage {
    JsonRpcMessage::Request(JsonRpcRequest {
        jsonrpc: default_version(),
        id: id.into(),
        method: method.to_string(),
        params,
    })
}

/// Create a one-way notification
pub fn notification(method: &str, params: Option<Value>) -> JsonRpcMessage {
    JsonRpcMessage::Notification(JsonRpcNotification {
        jsonrpc: default_version(),
        method: method.to_string(),
        params,
    })
}

/// Create a successful JSON-RPC response
pub fn success_response(id: impl Into<RequestId>, result: Value) -> JsonRpcMessage {
    JsonRpcMessage::Response(JsonRpcResponse {
        jsonrpc: default_version(),
        id: Some(id.into()),
        result: Some(result),
        error: None,
    })
}

/// Create a JSON-RPC error response
pub fn error_response(
    id: Option<RequestId>,
    code: i32,
    message: String,
    data: Option<Value>,
) -> JsonRpcMessage {
    JsonRpcMessage::Response(JsonRpcResponse {
        jsonrpc: default_version(),
        id,
        result: None,
        error: Some(JsonRpcErrorObject {
            code,
            message,
            data,
        }),
    })
}
