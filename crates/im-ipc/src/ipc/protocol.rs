//! Shared IPC protocol types.
//!
//! Defines the wire format for local IPC: one UTF-8 JSON-RPC 2.0 object per
//! line, terminated by `\n`.
//!
//! ```text
//! {"jsonrpc":"2.0","method":"echo","params":{"x":1},"id":"1"}\n
//! ```

use crate::error::{IpcError, RpcError};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request.
///
/// A request with `id: None` is a notification and never receives a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default = "empty_object")]
    pub params: Value,
    #[serde(default)]
    pub id: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl JsonRpcRequest {
    /// Create a request that expects a reply.
    pub fn new(method: impl Into<String>, params: Value, id: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: Some(id.into()),
        }
    }

    /// Create a notification.
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: None,
        }
    }

    /// The throwaway message a client sends right after connecting so the
    /// server can capture its credentials.
    pub fn credentials_probe() -> Self {
        Self::notification("", empty_object())
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawResponse", into = "RawResponse")]
pub enum JsonRpcResponse {
    Success {
        result: Value,
        id: Option<String>,
    },
    Error {
        error: RpcError,
        id: Option<String>,
    },
}

impl JsonRpcResponse {
    pub fn success(id: Option<String>, result: Value) -> Self {
        JsonRpcResponse::Success { result, id }
    }

    pub fn error(id: Option<String>, error: RpcError) -> Self {
        JsonRpcResponse::Error { error, id }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            JsonRpcResponse::Success { id, .. } | JsonRpcResponse::Error { id, .. } => {
                id.as_deref()
            }
        }
    }

    /// Collapse into the result value, turning an error response into
    /// `IpcError::Rpc`.
    pub fn into_result(self) -> std::result::Result<Value, IpcError> {
        match self {
            JsonRpcResponse::Success { result, .. } => Ok(result),
            JsonRpcResponse::Error { error, .. } => Err(IpcError::Rpc(error)),
        }
    }
}

/// On-the-wire shape of a response; exactly one of `result`/`error` is set.
#[derive(Serialize, Deserialize)]
struct RawResponse {
    jsonrpc: String,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
    #[serde(default)]
    id: Option<String>,
}

/// Keeps an explicit `"result": null` apart from a missing `result`.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<RawResponse> for JsonRpcResponse {
    type Error = String;

    fn try_from(raw: RawResponse) -> std::result::Result<Self, String> {
        if raw.jsonrpc != JSONRPC_VERSION {
            return Err(format!("unsupported jsonrpc version {:?}", raw.jsonrpc));
        }
        match (raw.result, raw.error) {
            (Some(result), None) => Ok(JsonRpcResponse::Success { result, id: raw.id }),
            (None, Some(error)) => Ok(JsonRpcResponse::Error { error, id: raw.id }),
            (Some(_), Some(_)) => Err("response carries both result and error".to_string()),
            (None, None) => Err("response carries neither result nor error".to_string()),
        }
    }
}

impl From<JsonRpcResponse> for RawResponse {
    fn from(response: JsonRpcResponse) -> Self {
        let (result, error, id) = match response {
            JsonRpcResponse::Success { result, id } => (Some(result), None, id),
            JsonRpcResponse::Error { error, id } => (None, Some(error), id),
        };
        RawResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result,
            error,
            id,
        }
    }
}

/// Authenticated identity of a connected peer.
///
/// Captured once per connection from kernel-reported socket credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpcUser {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
}

impl IpcUser {
    /// Identity of the current process.
    #[cfg(unix)]
    pub fn current_process() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            pid: nix::unistd::getpid().as_raw(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization_roundtrip() {
        let req = JsonRpcRequest::new("echo", json!({"x": 1}), "1");
        let json = serde_json::to_string(&req).unwrap();
        let parsed: JsonRpcRequest = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.jsonrpc, "2.0");
        assert_eq!(parsed.method, "echo");
        assert_eq!(parsed.id.as_deref(), Some("1"));
    }

    #[test]
    fn test_request_defaults_params_and_id() {
        let parsed: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"ping"}"#).unwrap();
        assert_eq!(parsed.params, json!({}));
        assert!(parsed.is_notification());
    }

    #[test]
    fn test_probe_is_notification() {
        let probe = JsonRpcRequest::credentials_probe();
        let json = serde_json::to_string(&probe).unwrap();
        assert!(json.contains("\"id\":null"));
    }

    #[test]
    fn test_response_success_serialization() {
        let resp = JsonRpcResponse::success(Some("1".into()), json!({"x": 1}));
        let json = serde_json::to_value(&resp).unwrap();

        assert_eq!(json, json!({"jsonrpc": "2.0", "result": {"x": 1}, "id": "1"}));
    }

    #[test]
    fn test_response_error_serialization() {
        let resp = JsonRpcResponse::error(Some("7".into()), RpcError::not_found("missing"));
        let json = serde_json::to_string(&resp).unwrap();

        assert!(!json.contains("\"result\""));
        assert!(json.contains("\"error\""));
        assert!(json.contains("404"));
    }

    #[test]
    fn test_response_decodes_error_variant() {
        let parsed: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","error":{"code":500,"message":"Internal Server Error","data":null},"id":"3"}"#,
        )
        .unwrap();
        assert_eq!(parsed.id(), Some("3"));
        match parsed.into_result() {
            Err(IpcError::Rpc(err)) => assert_eq!(err.code, 500),
            other => panic!("Expected Rpc error, got: {:?}", other),
        }
    }

    #[test]
    fn test_null_result_is_success() {
        let parsed: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","result":null,"id":"1"}"#).unwrap();
        assert_eq!(parsed, JsonRpcResponse::success(Some("1".into()), Value::Null));

        let missing = serde_json::from_str::<JsonRpcResponse>(r#"{"jsonrpc":"2.0","id":"1"}"#);
        assert!(missing.is_err());
    }

    #[test]
    fn test_response_with_both_fields_is_rejected() {
        let parsed = serde_json::from_str::<JsonRpcResponse>(
            r#"{"jsonrpc":"2.0","result":{},"error":{"code":1,"message":"x"},"id":"1"}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_response_with_wrong_version_is_rejected() {
        let parsed =
            serde_json::from_str::<JsonRpcResponse>(r#"{"jsonrpc":"1.0","result":{},"id":"1"}"#);
        assert!(parsed.is_err());
    }
}
