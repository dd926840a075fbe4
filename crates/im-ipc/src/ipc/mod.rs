//! Local IPC between the integration server and its user-mode workers.
//!
//! Peers exchange newline-delimited JSON-RPC 2.0 messages over a Unix domain
//! socket. The server identifies each peer from kernel-reported socket
//! credentials, so handlers always know which uid they are acting for.
//!
//! # Architecture
//!
//! - **Socket**: credential-passing socket primitives and buffered reads
//! - **Framing**: reassembles newline-delimited messages from the stream
//! - **Server**: accepts connections, authenticates peers, dispatches methods
//! - **Client**: socket client for workers, embedded client for the server
//! - **Ping-pong**: workers exit once the server they started with is gone
//! - **Proxy**: forwards allow-listed outer calls on behalf of workers

pub mod client;
pub mod container;
pub mod framing;
pub mod handler;
pub mod ping_pong;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod socket;

pub use client::{EmbeddedIpcClient, IpcClient, RealIpcClient};
pub use container::{IpcContainer, TypedIpcCall};
pub use framing::{IpcConnection, MessageBuilder};
pub use handler::{HandlerError, HandlerRegistry, HandlerResult, IpcHandler};
pub use ping_pong::{IpcPingPong, LivenessMonitor};
pub use protocol::{IpcUser, JsonRpcRequest, JsonRpcResponse};
pub use proxy::{AuthenticatedClient, IpcProxyClient, IpcProxyServer, ProxyRequest};
pub use server::{IpcServer, IpcServerHandle};
