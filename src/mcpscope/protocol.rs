//! Tool-protocol data model and JSON-RPC message helpers.
//!
//! This module defines the wire-level vocabulary shared by the proxy, the
//! resource indexer, the resource graph, and the agent orchestrator:
//!
//! - **Tool descriptors** ([`ToolInfo`], [`ToolSchema`]) as returned by a
//!   downstream server's `tools/list`.
//! - **The tool-call envelope** ([`ToolCallResult`]): an ordered list of typed
//!   content items where `text` items frequently carry JSON-encoded strings.
//! - **Envelope normalization** ([`parse_tool_payload`]): the single place
//!   where nested JSON payloads are unwrapped, so every consumer sees the
//!   same value for the same response.
//! - **JSON-RPC 2.0 views** over raw [`serde_json::Value`] messages, used by
//!   the proxy to classify traffic and synthesize error replies.
//!
//! # Envelope normalization
//!
//! ```rust
//! use mcpscope::protocol::parse_tool_payload;
//! use serde_json::json;
//!
//! let response = json!({
//!     "content": [{"type": "text", "text": "{\"id\": \"PROJ-42\"}"}]
//! });
//! assert_eq!(parse_tool_payload(&response), json!({"id": "PROJ-42"}));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// JSON-RPC method for tool discovery.
pub const METHOD_TOOLS_LIST: &str = "tools/list";
/// JSON-RPC method for tool invocation.
pub const METHOD_TOOLS_CALL: &str = "tools/call";
/// Error code used when forwarding a proxied request to the server fails.
pub const ERROR_FORWARD_FAILED: i64 = -32001;

/// Schema of a single tool parameter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolSchemaProperty {
    /// JSON type of the parameter (`"string"`, `"number"`, ...).
    #[serde(rename = "type", default)]
    pub prop_type: String,
    /// Human-readable description surfaced in LLM prompts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Closed set of accepted values, when the server constrains them.
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

/// Input schema of a tool: named parameters plus the required subset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(default)]
    pub properties: BTreeMap<String, ToolSchemaProperty>,
    #[serde(default)]
    pub required: Vec<String>,
}

/// Descriptor of a tool exposed by the downstream server.
///
/// Names are unique within a session; the schema drives both parameter
/// extraction prompts and the fallback paths when the LLM reply is unusable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: ToolSchema,
}

impl ToolInfo {
    /// Descriptor with an empty schema, mostly useful in tests.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: ToolSchema::default(),
        }
    }

    /// Attach a description (builder pattern).
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Register a parameter; `required` also appends it to the required list.
    pub fn with_param(
        mut self,
        name: impl Into<String>,
        prop_type: impl Into<String>,
        required: bool,
    ) -> Self {
        let name = name.into();
        self.input_schema.properties.insert(
            name.clone(),
            ToolSchemaProperty {
                prop_type: prop_type.into(),
                description: None,
                enum_values: None,
            },
        );
        if required {
            self.input_schema.required.push(name);
        }
        self
    }
}

/// One item of a tool-call result envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub content_type: String,
    /// Payload for `text` items; often a JSON document in string form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Structured result of a `tools/call` invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
}

/// Normalize a tool-call response for extraction and flattening.
///
/// If `response` carries a `content` array, every `{type:"text"}` item whose
/// `text` parses as JSON is collected. Exactly one parsed value replaces the
/// response; two or more become an array of parsed values; zero leaves the
/// original response untouched. Responses without an envelope pass through
/// unchanged.
pub fn parse_tool_payload(response: &Value) -> Value {
    let items = match response.get("content").and_then(Value::as_array) {
        Some(items) => items,
        None => return response.clone(),
    };

    let mut parsed: Vec<Value> = Vec::new();
    for item in items {
        if item.get("type").and_then(Value::as_str) != Some("text") {
            continue;
        }
        if let Some(text) = item.get("text").and_then(Value::as_str) {
            if let Ok(value) = serde_json::from_str::<Value>(text) {
                parsed.push(value);
            }
        }
    }

    match parsed.len() {
        0 => response.clone(),
        1 => parsed.remove(0),
        _ => Value::Array(parsed),
    }
}

/// Method name of a JSON-RPC message, if any.
pub fn rpc_method(message: &Value) -> Option<&str> {
    message.get("method").and_then(Value::as_str)
}

/// Id of a JSON-RPC message, if any.
pub fn rpc_id(message: &Value) -> Option<&Value> {
    message.get("id").filter(|id| !id.is_null())
}

/// A request carries both a method and an id (notifications have no id).
pub fn is_request(message: &Value) -> bool {
    rpc_method(message).is_some() && rpc_id(message).is_some()
}

/// A response carries an id plus a result or error, and no method.
pub fn is_response(message: &Value) -> bool {
    rpc_method(message).is_none()
        && rpc_id(message).is_some()
        && (message.get("result").is_some() || message.get("error").is_some())
}

/// Canonical correlation key for a JSON-RPC id.
///
/// Ids may be numbers or strings; the key is the id's JSON text, which keeps
/// `42` and `"42"` distinct the way the protocol requires.
pub fn correlation_key(id: &Value) -> String {
    id.to_string()
}

/// Build a JSON-RPC error response addressed to `id`.
pub fn error_response(id: &Value, code: i64, message: &str, data: Option<Value>) -> Value {
    let mut error = serde_json::json!({
        "code": code,
        "message": message,
    });
    if let Some(data) = data {
        error["data"] = data;
    }
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id.clone(),
        "error": error,
    })
}
