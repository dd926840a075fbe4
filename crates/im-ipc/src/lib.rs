//! IM IPC - Unix-socket JSON-RPC transport for the integration module.
//!
//! The privileged server process owns the socket and the outer service
//! credentials. User-mode workers connect to it, are identified by their
//! socket credentials, and reach the outer service only through the proxy.
//!
//! # Example
//!
//! ```rust,ignore
//! use im_ipc::{IpcHandler, IpcServer, IpcSettings};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> im_ipc::Result<()> {
//!     let server = IpcServer::new(IpcSettings::default());
//!     server.add_handler(IpcHandler::new("whoami", |user, _| async move {
//!         Ok(json!({ "uid": user.uid }))
//!     }))?;
//!
//!     let handle = server.start().await?;
//!     handle.wait().await
//! }
//! ```

pub mod config;
pub mod error;
pub mod ipc;

// Re-export commonly used types
pub use config::{IpcConfig, IpcSettings};
pub use error::{IpcError, Result, RpcError};
pub use ipc::{
    AuthenticatedClient, EmbeddedIpcClient, HandlerError, IpcClient, IpcContainer, IpcHandler,
    IpcPingPong, IpcProxyClient, IpcProxyServer, IpcServer, IpcServerHandle, IpcUser,
    JsonRpcRequest, JsonRpcResponse, LivenessMonitor, RealIpcClient, TypedIpcCall,
};
