//! Wire types for the stdio JSON-RPC protocol spoken to the MCP subprocess.
//!
//! One JSON frame per line, strictly request-then-response: the bridge never
//! has more than one exchange in flight, so responses correlate positionally
//! and the `id` field is a sanity check rather than a routing key.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const CLIENT_NAME: &str = "finops-gateway";
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A single JSON-RPC request frame.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }

    /// Build the `initialize` handshake frame.
    pub fn initialize(id: u64) -> Self {
        Self::new(
            id,
            "initialize",
            serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": CLIENT_NAME,
                    "version": CLIENT_VERSION,
                }
            }),
        )
    }
}

/// A single JSON-RPC response frame. Exactly one of `result`/`error` is
/// expected; unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// Tool descriptor as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// Extract the tool list from a `tools/list` result, tolerating a missing
/// or malformed `tools` array (treated as no tools).
pub fn parse_tool_list(result: Option<&Value>) -> Vec<ToolDescriptor> {
    result
        .and_then(|r| r.get("tools"))
        .and_then(|t| serde_json::from_value(t.clone()).ok())
        .unwrap_or_default()
}

/// Extract the text payload from a `tools/call` result.
///
/// MCP tool results carry a `content` array of blocks; the first block's
/// `text` is the payload. Falls back to the raw result JSON so a
/// non-conforming server still produces something usable.
pub fn extract_tool_text(result: Option<&Value>) -> String {
    if let Some(text) = result
        .and_then(|r| r.get("content"))
        .and_then(|c| c.as_array())
        .and_then(|blocks| blocks.first())
        .and_then(|b| b.get("text"))
        .and_then(|t| t.as_str())
    {
        return text.to_string();
    }
    result
        .map(|r| r.to_string())
        .unwrap_or_else(|| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_shape() {
        let req = RpcRequest::new(7, "tools/call", serde_json::json!({"name": "x"}));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 7);
        assert_eq!(json["method"], "tools/call");
        assert_eq!(json["params"]["name"], "x");
    }

    #[test]
    fn test_initialize_frame() {
        let req = RpcRequest::initialize(1);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["method"], "initialize");
        assert_eq!(json["params"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(json["params"]["clientInfo"]["name"], CLIENT_NAME);
    }

    #[test]
    fn test_response_with_error_field() {
        let resp: RpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601}}"#).unwrap();
        assert_eq!(resp.id, Some(3));
        assert!(resp.result.is_none());
        assert!(resp.error.is_some());
    }

    #[test]
    fn test_response_ignores_unknown_fields() {
        let resp: RpcResponse =
            serde_json::from_str(r#"{"id":1,"method":"echoed","params":{},"result":{"ok":true}}"#)
                .unwrap();
        assert_eq!(resp.result.unwrap()["ok"], true);
    }

    #[test]
    fn test_parse_tool_list() {
        let result = serde_json::json!({
            "tools": [
                {"name": "query_costs", "description": "Query costs", "inputSchema": {"type": "object"}},
                {"name": "get_filters"}
            ]
        });
        let tools = parse_tool_list(Some(&result));
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "query_costs");
        assert_eq!(tools[1].description, "");
    }

    #[test]
    fn test_parse_tool_list_missing() {
        assert!(parse_tool_list(None).is_empty());
        assert!(parse_tool_list(Some(&serde_json::json!({}))).is_empty());
    }

    #[test]
    fn test_extract_tool_text() {
        let result = serde_json::json!({"content": [{"type": "text", "text": "42 services"}]});
        assert_eq!(extract_tool_text(Some(&result)), "42 services");
    }

    #[test]
    fn test_extract_tool_text_fallback() {
        let result = serde_json::json!({"rows": 3});
        assert_eq!(extract_tool_text(Some(&result)), r#"{"rows":3}"#);
        assert_eq!(extract_tool_text(None), "{}");
    }
}
