//! Typed wrappers for the MCP methods this crate uses.
//!
//! A subset of the MCP schema; unknown fields are ignored on the way in.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{McpNotification, McpRequest};

/// Name and version of an MCP client or server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Implementation {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Implementation {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            title: None,
        }
    }

    /// This crate, as it introduces itself to servers.
    pub fn mcplens() -> Self {
        Self::new("mcplens", env!("CARGO_PKG_VERSION"))
    }
}

pub enum InitializeRequest {}

impl McpRequest for InitializeRequest {
    const METHOD: &'static str = "initialize";
    type Params = InitializeRequestParams;
    type Result = InitializeResult;
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequestParams {
    pub protocol_version: String,
    pub capabilities: Value,
    pub client_info: Implementation,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    /// Absent when the server does not identify itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Implementation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

pub enum InitializedNotification {}

impl McpNotification for InitializedNotification {
    const METHOD: &'static str = "notifications/initialized";
    type Params = Option<Value>;
}

pub enum PingRequest {}

impl McpRequest for PingRequest {
    const METHOD: &'static str = "ping";
    type Params = Option<Value>;
    type Result = Value;
}

pub enum ListToolsRequest {}

impl McpRequest for ListToolsRequest {
    const METHOD: &'static str = "tools/list";
    type Params = Option<ListToolsRequestParams>;
    type Result = ListToolsResult;
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ListToolsRequestParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub tools: Vec<Tool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_result_tolerates_missing_server_info() {
        let result: InitializeResult = serde_json::from_value(serde_json::json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {"tools": {}},
        }))
        .unwrap();
        assert!(result.server_info.is_none());

        let result: InitializeResult = serde_json::from_value(serde_json::json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "serverInfo": {"name": "demo", "version": "1.2.3"},
        }))
        .unwrap();
        assert_eq!(
            result.server_info,
            Some(Implementation::new("demo", "1.2.3"))
        );
    }

    #[test]
    fn tools_default_their_input_schema() {
        let result: ListToolsResult = serde_json::from_value(serde_json::json!({
            "tools": [{"name": "echo", "description": "Echo input"}],
        }))
        .unwrap();
        assert_eq!(result.tools[0].input_schema, serde_json::json!({"type": "object"}));
        assert_eq!(result.next_cursor, None);
    }
}
