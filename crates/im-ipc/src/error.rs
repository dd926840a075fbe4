//! Error types for the IPC transport.
//!
//! `IpcError` covers everything that can go wrong inside the transport itself
//! (sockets, framing, authentication, client lifecycle). `RpcError` is the
//! status-coded error that handlers and the outer RPC service report to the
//! peer; it doubles as the JSON-RPC `error` object on the wire.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the IPC transport.
#[derive(Debug, Error)]
pub enum IpcError {
    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Connection closed by peer")]
    ConnectionClosed,

    // Framing errors
    #[error("Message exceeds buffer capacity of {capacity} bytes")]
    MessageTooLarge { capacity: usize },

    #[error("Message is not valid UTF-8")]
    InvalidUtf8,

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Protocol and authentication errors
    #[error("Protocol violation: {message}")]
    Protocol { message: String },

    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Socket path {path:?} is {length} bytes, must be shorter than {max}")]
    SocketPathTooLong {
        path: PathBuf,
        length: usize,
        max: usize,
    },

    // Lifecycle errors
    #[error("Cannot register handler for {method}: handlers are frozen once the server starts")]
    HandlersFrozen { method: String },

    #[error("IPC client is already connected")]
    AlreadyConnected,

    #[error("IPC client is not connected")]
    NotConnected,

    // Remote errors
    #[error("Remote call failed: {0}")]
    Rpc(RpcError),
}

/// Result type alias for IPC operations.
pub type Result<T> = std::result::Result<T, IpcError>;

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        IpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<RpcError> for IpcError {
    fn from(err: RpcError) -> Self {
        IpcError::Rpc(err)
    }
}

impl IpcError {
    pub fn protocol(message: impl Into<String>) -> Self {
        IpcError::Protocol {
            message: message.into(),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        IpcError::Authentication {
            message: message.into(),
        }
    }
}

/// Status-coded error reported to the peer.
///
/// Codes follow HTTP status semantics, matching the outer RPC service whose
/// errors are forwarded through the proxy bridge unchanged.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message} (status {code})")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub const BAD_REQUEST: i32 = 400;
    pub const FORBIDDEN: i32 = 403;
    pub const NOT_FOUND: i32 = 404;
    pub const INTERNAL_SERVER_ERROR: i32 = 500;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Create an error carrying the canonical message for `code`.
    pub fn from_status(code: i32) -> Self {
        let message = match code {
            Self::BAD_REQUEST => "Bad Request",
            Self::FORBIDDEN => "Forbidden",
            Self::NOT_FOUND => "Not Found",
            Self::INTERNAL_SERVER_ERROR => "Internal Server Error",
            _ => "Error",
        };
        Self::new(code, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(Self::BAD_REQUEST, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(Self::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Self::NOT_FOUND, message)
    }

    /// The generic internal error. Never carries the underlying detail.
    pub fn internal() -> Self {
        Self::from_status(Self::INTERNAL_SERVER_ERROR)
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IpcError::MessageTooLarge { capacity: 16 };
        assert_eq!(
            err.to_string(),
            "Message exceeds buffer capacity of 16 bytes"
        );
    }

    #[test]
    fn test_rpc_error_from_status() {
        let err = RpcError::from_status(RpcError::NOT_FOUND);
        assert_eq!(err.code, 404);
        assert_eq!(err.message, "Not Found");
        assert!(err.data.is_none());
    }

    #[test]
    fn test_internal_error_has_no_detail() {
        let err = RpcError::internal();
        assert_eq!(err.code, 500);
        assert_eq!(err.message, "Internal Server Error");
    }

    #[test]
    fn test_rpc_error_omits_missing_data() {
        let json = serde_json::to_string(&RpcError::forbidden("nope")).unwrap();
        assert_eq!(json, r#"{"code":403,"message":"nope"}"#);
    }
}
