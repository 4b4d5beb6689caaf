use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// MCP protocol version offered during `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Typed MCP request: method name, params and result shape.
pub trait McpRequest {
    const METHOD: &'static str;
    type Params: Serialize;
    type Result: DeserializeOwned;
}

/// Typed MCP notification.
pub trait McpNotification {
    const METHOD: &'static str;
    type Params: Serialize;
}

/// How an inbound JSON-RPC value should be routed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Incoming<'a> {
    /// A reply to one of our requests.
    Response { id: &'a Value },
    /// A request from the server that needs an answer.
    Request { id: &'a Value, method: &'a str },
    Notification { method: &'a str },
    Invalid,
}

pub(crate) fn classify(value: &Value) -> Incoming<'_> {
    let method = value.get("method").and_then(Value::as_str);
    let id = value.get("id").filter(|id| !id.is_null());
    match (method, id) {
        (Some(method), Some(id)) => Incoming::Request { id, method },
        (Some(method), None) => Incoming::Notification { method },
        (None, Some(id)) if value.get("result").is_some() || value.get("error").is_some() => {
            Incoming::Response { id }
        }
        _ => Incoming::Invalid,
    }
}

pub(crate) fn request(id: u64, method: &str, params: Option<Value>) -> Value {
    let mut message = serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
    });
    if let Some(params) = params.filter(|params| !params.is_null()) {
        message["params"] = params;
    }
    message
}

pub(crate) fn notification(method: &str, params: Option<Value>) -> Value {
    let mut message = serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
    });
    if let Some(params) = params.filter(|params| !params.is_null()) {
        message["params"] = params;
    }
    message
}

pub(crate) fn result_response(id: &Value, result: Value) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

pub(crate) fn error_response(id: &Value, code: i64, message: &str) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": code, "message": message },
    })
}
