//! IPC clients.
//!
//! [`RealIpcClient`] talks to the server over the socket from a dedicated
//! send-loop task. [`EmbeddedIpcClient`] is used inside the server process
//! itself and dispatches straight into the server's handler registry.
//!
//! # Thread Safety
//!
//! Callers on any task share one outbound queue. The send loop is its only
//! consumer and waits for each response before taking the next request, so a
//! connection never has more than one request in flight.

use super::framing::IpcConnection;
use super::protocol::{IpcUser, JsonRpcRequest, JsonRpcResponse};
use super::server::IpcServer;
use super::socket::{IpcTransport, UnixTransport};
use crate::config::IpcSettings;
use crate::error::{IpcError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Request/response access to the IPC server.
#[async_trait]
pub trait IpcClient: Send + Sync {
    /// Send a request and wait for its response.
    ///
    /// The request must carry an id; notifications are rejected.
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse>;

    /// Call `method` and return its result.
    ///
    /// Error responses come back as `IpcError::Rpc`.
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let request = JsonRpcRequest::new(method, params, uuid::Uuid::new_v4().to_string());
        self.send_request(request).await?.into_result()
    }
}

fn require_id(request: &JsonRpcRequest) -> Result<()> {
    if request.is_notification() {
        return Err(IpcError::protocol(format!(
            "request for {} expects a reply but has no id",
            request.method
        )));
    }
    Ok(())
}

struct QueuedRequest {
    request: JsonRpcRequest,
    reply: oneshot::Sender<Result<JsonRpcResponse>>,
}

/// Socket-backed client used by user-mode processes.
pub struct RealIpcClient {
    socket_path: PathBuf,
    message_capacity: usize,
    connecting: AtomicBool,
    queue: OnceLock<mpsc::UnboundedSender<QueuedRequest>>,
}

impl RealIpcClient {
    pub fn new(settings: &IpcSettings) -> Result<Self> {
        Ok(Self {
            socket_path: settings.socket_path()?,
            message_capacity: settings.message_capacity,
            connecting: AtomicBool::new(false),
            queue: OnceLock::new(),
        })
    }

    /// Open the socket, announce ourselves, and start the send loop.
    ///
    /// Must be called exactly once.
    pub async fn connect(&self) -> Result<()> {
        if self.connecting.swap(true, Ordering::SeqCst) {
            return Err(IpcError::AlreadyConnected);
        }

        let connection = match self.open().await {
            Ok(connection) => connection,
            Err(e) => {
                self.connecting.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.queue
            .set(tx)
            .map_err(|_| IpcError::AlreadyConnected)?;

        info!("IPC client connected to {}", self.socket_path.display());
        tokio::spawn(send_loop(connection, rx));
        Ok(())
    }

    async fn open(&self) -> Result<IpcConnection<UnixTransport>> {
        let transport = UnixTransport::connect(&self.socket_path).await?;
        let mut connection = IpcConnection::new(transport, self.message_capacity);
        connection
            .write_request(&JsonRpcRequest::credentials_probe())
            .await?;
        Ok(connection)
    }

    pub fn is_connected(&self) -> bool {
        self.queue.get().is_some_and(|queue| !queue.is_closed())
    }
}

#[async_trait]
impl IpcClient for RealIpcClient {
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        require_id(&request)?;
        let queue = self.queue.get().ok_or(IpcError::NotConnected)?;

        let (reply, response) = oneshot::channel();
        queue
            .send(QueuedRequest { request, reply })
            .map_err(|_| IpcError::ConnectionClosed)?;

        response.await.map_err(|_| IpcError::ConnectionClosed)?
    }
}

/// Drain the outbound queue, one request at a time.
async fn send_loop<T: IpcTransport>(
    mut connection: IpcConnection<T>,
    mut queue: mpsc::UnboundedReceiver<QueuedRequest>,
) {
    while let Some(QueuedRequest { request, reply }) = queue.recv().await {
        let method = request.method.clone();
        let outcome = exchange(&mut connection, &request).await;

        if let Err(e) = &outcome {
            warn!("IPC request {} failed, closing connection: {}", method, e);
            let _ = reply.send(outcome);
            break;
        }
        let _ = reply.send(outcome);
    }
    // Dropping the receiver fails every request still queued.
    queue.close();
    debug!("IPC client send loop finished");
}

async fn exchange<T: IpcTransport>(
    connection: &mut IpcConnection<T>,
    request: &JsonRpcRequest,
) -> Result<JsonRpcResponse> {
    connection.write_request(request).await?;
    let response = connection.read_response().await?;

    if response.id() != request.id.as_deref() {
        return Err(IpcError::protocol(format!(
            "response id {:?} does not match request id {:?}",
            response.id(),
            request.id
        )));
    }
    Ok(response)
}

/// In-process client for the server itself.
///
/// Requests skip the socket and run against the server's handlers as the
/// current process. The handler list is frozen on first use.
pub struct EmbeddedIpcClient {
    server: Arc<IpcServer>,
    user: IpcUser,
}

impl EmbeddedIpcClient {
    pub fn new(server: Arc<IpcServer>) -> Self {
        Self {
            server,
            user: IpcUser::current_process(),
        }
    }
}

#[async_trait]
impl IpcClient for EmbeddedIpcClient {
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        require_id(&request)?;
        let registry = self.server.freeze();
        Ok(registry.dispatch(&self.user, request).await)
    }
}
