//! Shared wire types for the companion protocol
//!
//! JSON-RPC 2.0 envelope, the `initialize` handshake payloads, and the error
//! taxonomy surfaced to tool callers. Everything that crosses a process
//! boundary is camelCase on the wire.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JSON-RPC request id; the CLI side sends both numeric and string ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

/// One inbound JSON-RPC message. Requests without an id are notifications
/// and receive no response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: Option<RequestId>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Server-initiated message with no reply expected (resolution pushes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    pub params: serde_json::Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub fn parse_error(source: &serde_json::Error) -> Self {
        Self {
            code: -32700,
            message: format!("parse error: {source}"),
            data: None,
        }
    }
}

/// Client half of the `initialize` handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub client_info: PeerInfo,
    #[serde(default)]
    pub capabilities: serde_json::Value,
}

/// Server half of the `initialize` handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub server_info: PeerInfo,
    pub capabilities: ServerCapabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    pub tools: ToolCapabilities,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCapabilities {}

/// Parameters of a `tools/call` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// One entry of the `tools/list` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Whether a change block adds or removes lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
}

/// One highlighted block of a rendered diff. Lines are 1-based and refer to
/// the proposed content; removed blocks are zero-width anchors marking where
/// the removed text used to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRegion {
    pub kind: ChangeKind,
    pub start_line: u32,
    /// Exclusive; equals `start_line` for zero-width anchors.
    pub end_line: u32,
}

/// Errors surfaced across the protocol boundary.
///
/// Transport-level failures never reach this taxonomy; they are recovered
/// locally by dropping the connection and letting the next discovery read
/// find a live server.
#[derive(Error, Debug)]
pub enum CompanionError {
    #[error("no valid discovery record found")]
    DiscoveryUnavailable,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("path is outside every workspace root: {}", .0.display())]
    OutOfScopePath(PathBuf),

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CompanionError {
    pub fn code(&self) -> i64 {
        match self {
            CompanionError::StateConflict(_) => -32000,
            CompanionError::OutOfScopePath(_) => -32001,
            CompanionError::AuthenticationFailed => -32002,
            CompanionError::DiscoveryUnavailable => -32003,
            CompanionError::ProtocolError(_) => -32600,
            CompanionError::ToolNotFound(_) => -32601,
            CompanionError::InvalidArguments(_) => -32602,
            CompanionError::Internal(_) => -32603,
        }
    }

    pub fn to_rpc_error(&self) -> RpcError {
        RpcError {
            code: self.code(),
            message: self.to_string(),
            data: None,
        }
    }
}
