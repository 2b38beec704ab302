//! MCP payload shapes used over the stdio transport
//!
//! Only the handful of fields the probe reads or writes are modeled. Every
//! field a server may omit has a default, so a sparse reply decodes to an
//! empty value instead of failing.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Decode an explicit `null` like a missing field
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// MCP protocol revision announced during the handshake
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Method names
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

/// Name/version pair identifying a client or server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl Implementation {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

// ============================================================================
// initialize
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Map<String, Value>,
    pub client_info: Implementation,
}

impl InitializeParams {
    pub fn new(client_info: Implementation) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: Map::new(),
            client_info,
        }
    }
}

/// Identity the server advertises; both fields are optional in practice
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PeerInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub server_info: Option<PeerInfo>,
    #[serde(default)]
    pub capabilities: Option<Value>,
}

impl InitializeResult {
    /// Advertised server name, if any
    pub fn server_name(&self) -> Option<&str> {
        self.server_info.as_ref()?.name.as_deref()
    }
}

// ============================================================================
// tools/list
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Option<Value>,
}

/// A reply without `tools` means no tools
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListToolsResult {
    #[serde(default, deserialize_with = "null_as_default")]
    pub tools: Vec<ToolDescriptor>,
}

// ============================================================================
// tools/call
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct CallToolParams {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ContentItem {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: Vec<ContentItem>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_error: bool,
}

impl CallToolResult {
    /// Text of the first content item; None when content is empty or textless
    pub fn first_text(&self) -> Option<&str> {
        self.content.first()?.text.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_initialize_params_wire_shape() {
        let params = InitializeParams::new(Implementation::new("mcp-probe", "0.1.0"));
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "mcp-probe", "version": "0.1.0"}
            })
        );
    }

    #[test]
    fn test_sparse_results_decode_to_defaults() {
        let init: InitializeResult = serde_json::from_value(json!({})).unwrap();
        assert_eq!(init.server_name(), None);

        let init: InitializeResult =
            serde_json::from_value(json!({"serverInfo": {"version": "1"}})).unwrap();
        assert_eq!(init.server_name(), None);

        let list: ListToolsResult = serde_json::from_value(json!({})).unwrap();
        assert!(list.tools.is_empty());

        let call: CallToolResult = serde_json::from_value(json!({"content": []})).unwrap();
        assert_eq!(call.first_text(), None);
        assert!(!call.is_error);
    }

    #[test]
    fn test_null_fields_decode_to_defaults() {
        let list: ListToolsResult = serde_json::from_value(json!({"tools": null})).unwrap();
        assert!(list.tools.is_empty());

        let call: CallToolResult =
            serde_json::from_value(json!({"content": null, "isError": null})).unwrap();
        assert_eq!(call.first_text(), None);
        assert!(!call.is_error);
    }

    #[test]
    fn test_call_result_first_text() {
        let call: CallToolResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "{\"status\":\"built\"}"},
                {"type": "text", "text": "ignored"}
            ],
            "isError": true
        }))
        .unwrap();

        assert_eq!(call.first_text(), Some("{\"status\":\"built\"}"));
        assert!(call.is_error);

        let image: CallToolResult =
            serde_json::from_value(json!({"content": [{"type": "image"}]})).unwrap();
        assert_eq!(image.first_text(), None);
    }

    #[test]
    fn test_tool_descriptor_requires_name() {
        let tools: ListToolsResult = serde_json::from_value(json!({
            "tools": [{"name": "request_capability", "inputSchema": {"type": "object"}}]
        }))
        .unwrap();
        assert_eq!(tools.tools[0].name, "request_capability");

        assert!(serde_json::from_value::<ListToolsResult>(json!({"tools": [{}]})).is_err());
    }
}
