use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// DAP request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct DapRequest {
    #[serde(default)]
    pub seq: i64,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

impl DapRequest {
    pub fn new(seq: i64, command: &str, arguments: Value) -> Self {
        Self {
            seq,
            command: command.to_string(),
            arguments,
        }
    }
}

/// Response from the client to a request sent by the adapter.
#[derive(Debug, Clone, Deserialize)]
pub struct DapClientResponse {
    pub request_seq: i64,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub body: Value,
}

/// Any message read from a channel.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Request(DapRequest),
    Response(DapClientResponse),
    Event(Value),
}

impl InboundMessage {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("request")
            .to_string();
        Ok(match kind.as_str() {
            "response" => InboundMessage::Response(serde_json::from_value(value)?),
            "event" => InboundMessage::Event(value),
            _ => InboundMessage::Request(serde_json::from_value(value)?),
        })
    }
}

/// DAP response envelope, `body` is omitted when empty.
#[derive(Debug, Serialize)]
pub struct DapResponse {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// DAP event envelope.
#[derive(Debug, Serialize)]
pub struct DapEvent {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Request sent from the adapter to the client (`runInTerminal` and friends).
#[derive(Debug, Serialize)]
pub struct DapReverseRequest {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub command: &'static str,
    pub arguments: Value,
}

/// Body of a failed response the client shows to the user.
pub fn error_body(message: &str) -> Value {
    json!({
        "error": {
            "id": 0,
            "format": message,
            "showUser": true,
        }
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_reference: Option<i64>,
}

impl Source {
    pub fn from_path(path: &str) -> Self {
        let name = std::path::Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        Self {
            name,
            path: Some(path.to_string()),
            source_reference: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBreakpoint {
    pub line: u32,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub hit_condition: Option<String>,
    #[serde(default)]
    pub log_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionBreakpoint {
    pub name: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub hit_condition: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub value: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub variables_reference: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluate_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    pub line: u32,
    pub column: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presentation_hint: Option<&'static str>,
}
