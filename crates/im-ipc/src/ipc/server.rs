//! Unix-socket IPC server for the privileged integration process.
//!
//! Binds `<directory>/ipc.sock`, authenticates every connection through the
//! kernel-reported credentials of its first message, and dispatches JSON-RPC
//! requests to registered handlers.
//!
//! # Thread Safety
//!
//! Each connection is handled in its own spawned task. A semaphore bounds the
//! number of live connection tasks; when all slots are taken the accept loop
//! waits, leaving further clients in the kernel backlog. The handler list is
//! frozen into an `Arc<HandlerRegistry>` at start and read without locking.

use super::framing::IpcConnection;
use super::handler::{HandlerRegistry, IpcHandler};
use super::protocol::IpcUser;
use super::socket::{enable_credentials, IpcTransport, UnixTransport};
use crate::config::{IpcConfig, IpcSettings};
use crate::error::{IpcError, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{oneshot, watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Handle to a running IPC server. Dropping shuts down the server.
pub struct IpcServerHandle {
    socket_path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl IpcServerHandle {
    /// Get the path the server is listening on.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Shut down the server gracefully.
    ///
    /// Stops accepting new connections and signals all active connection
    /// handlers to close.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }

    /// Wait for the accept loop to finish.
    pub async fn wait(mut self) -> Result<()> {
        if let Some(handle) = self.task_handle.take() {
            handle.await.map_err(std::io::Error::other)?;
        }
        Ok(())
    }
}

impl Drop for IpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// IPC server.
///
/// Handlers are added before [`IpcServer::start`]; afterwards the handler
/// list is frozen and further registrations fail.
pub struct IpcServer {
    settings: IpcSettings,
    pending: Mutex<Vec<IpcHandler>>,
    registry: OnceLock<Arc<HandlerRegistry>>,
}

impl IpcServer {
    pub fn new(settings: IpcSettings) -> Self {
        Self {
            settings,
            pending: Mutex::new(Vec::new()),
            registry: OnceLock::new(),
        }
    }

    pub fn settings(&self) -> &IpcSettings {
        &self.settings
    }

    /// Register a handler. Fails once the handler list is frozen.
    pub fn add_handler(&self, handler: IpcHandler) -> Result<()> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if self.registry.get().is_some() {
            return Err(IpcError::HandlersFrozen {
                method: handler.method().to_string(),
            });
        }
        debug!("Registered IPC handler {}", handler.method());
        pending.push(handler);
        Ok(())
    }

    /// Freeze the handler list. Idempotent.
    pub fn freeze(&self) -> Arc<HandlerRegistry> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        self.registry
            .get_or_init(|| Arc::new(HandlerRegistry::new(std::mem::take(&mut *pending))))
            .clone()
    }

    /// The frozen handler list, if the server has started.
    pub fn registry(&self) -> Option<Arc<HandlerRegistry>> {
        self.registry.get().cloned()
    }

    /// Bind the socket and start accepting connections in the background.
    pub async fn start(&self) -> Result<IpcServerHandle> {
        self.settings.validate()?;
        let socket_path = self.settings.socket_path()?;

        match std::fs::remove_file(&socket_path) {
            Ok(()) => debug!("Removed stale IPC socket {}", socket_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&socket_path)?;
        std::fs::set_permissions(
            &socket_path,
            std::fs::Permissions::from_mode(IpcConfig::SOCKET_MODE),
        )?;
        enable_credentials(&listener)?;

        let registry = self.freeze();
        info!(
            "IPC server listening on {} ({} handlers)",
            socket_path.display(),
            registry.len()
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let slots = Arc::new(Semaphore::new(self.settings.max_connections));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            registry,
            self.settings.message_capacity,
            slots,
            shutdown_rx,
            conn_shutdown_rx,
        ));

        Ok(IpcServerHandle {
            socket_path,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: UnixListener,
        registry: Arc<HandlerRegistry>,
        message_capacity: usize,
        slots: Arc<Semaphore>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let permit = tokio::select! {
                _ = &mut shutdown_rx => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let stream = tokio::select! {
                _ = &mut shutdown_rx => break,
                accept_result = listener.accept() => match accept_result {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        error!("IPC accept error: {}", e);
                        continue;
                    }
                },
            };

            let registry = registry.clone();
            let mut conn_shutdown = conn_shutdown_rx.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) =
                    Self::handle_stream(stream, &registry, message_capacity, &mut conn_shutdown).await
                {
                    debug!("IPC connection ended: {}", e);
                }
            });
        }
        info!("IPC server shutting down");
    }

    async fn handle_stream(
        stream: UnixStream,
        registry: &HandlerRegistry,
        message_capacity: usize,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let transport = UnixTransport::server(stream)?;
        let mut connection = IpcConnection::new(transport, message_capacity);
        serve_connection(&mut connection, registry, shutdown_rx).await
    }
}

/// Read the probe message and derive the peer's identity from it.
async fn authenticate<T: IpcTransport>(connection: &mut IpcConnection<T>) -> Result<IpcUser> {
    let probe = connection.read_request().await?;
    if probe.id.is_some() {
        return Err(IpcError::authentication(
            "first message must be a notification",
        ));
    }
    connection
        .transport()
        .peer_credentials()
        .ok_or_else(|| IpcError::authentication("peer credentials unavailable"))
}

/// Authenticate a connection and serve its requests until it closes.
pub(crate) async fn serve_connection<T: IpcTransport>(
    connection: &mut IpcConnection<T>,
    registry: &HandlerRegistry,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    let user = match authenticate(connection).await {
        Ok(user) => user,
        Err(e) => {
            warn!("Rejecting IPC connection: {}", e);
            return Err(e);
        }
    };
    debug!(
        "IPC connection authenticated as uid={} gid={} pid={}",
        user.uid, user.gid, user.pid
    );

    loop {
        let request = tokio::select! {
            result = connection.read_request() => result?,
            _ = shutdown_rx.changed() => return Ok(()),
        };

        if request.is_notification() {
            continue;
        }

        let method = request.method.clone();
        let response = registry.dispatch(&user, request).await;
        if let Err(e) = connection.write_response(&response).await {
            warn!("Failed to write IPC response for {}: {}", method, e);
            return Err(e);
        }
    }
}
