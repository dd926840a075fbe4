//! Centralized configuration for the IPC transport.
//!
//! Compile-time constants live on `IpcConfig`; per-deployment values are
//! carried by `IpcSettings`.

use crate::error::{IpcError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// IPC protocol and transport constants.
pub struct IpcConfig;

impl IpcConfig {
    pub const DEFAULT_DIRECTORY: &'static str = "/var/run/ucloud";
    pub const SOCKET_FILE_NAME: &'static str = "ipc.sock";
    /// `sizeof(sockaddr_un.sun_path)` on Linux, including the trailing NUL.
    pub const MAX_SOCKET_PATH_LENGTH: usize = 108;
    pub const SOCKET_MODE: u32 = 0o777;

    // Buffers
    pub const MESSAGE_CAPACITY: usize = 1024 * 1024;
    pub const PIPE_BUFFER_SIZE: usize = 4096;

    // Server
    pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

    // Ping-pong
    pub const PING_METHOD: &'static str = "ping";
    pub const PING_INTERVAL: Duration = Duration::from_secs(1);
    /// How long a single ping may go unanswered.
    pub const PING_TIMEOUT: Duration = Duration::from_secs(5);
    pub const PING_FAILURE_THRESHOLD: u32 = 5;

    // Proxy
    pub const PROXY_METHOD: &'static str = "ipc_proxy.call";
}

/// Runtime settings for a server or client.
#[derive(Debug, Clone)]
pub struct IpcSettings {
    /// Directory holding the socket file.
    pub directory: PathBuf,
    /// Number of connections served concurrently.
    pub max_connections: usize,
    /// Largest single message, including the delimiter.
    pub message_capacity: usize,
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(IpcConfig::DEFAULT_DIRECTORY),
            max_connections: IpcConfig::DEFAULT_MAX_CONNECTIONS,
            message_capacity: IpcConfig::MESSAGE_CAPACITY,
        }
    }
}

impl IpcSettings {
    pub fn with_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    /// Full path of the socket file, validated for use as a socket address.
    pub fn socket_path(&self) -> Result<PathBuf> {
        let path = self.directory.join(IpcConfig::SOCKET_FILE_NAME);
        crate::ipc::socket::socket_address(&path)?;
        Ok(path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(IpcError::Config {
                message: "max_connections must be at least 1".to_string(),
            });
        }
        if self.message_capacity < IpcConfig::PIPE_BUFFER_SIZE {
            return Err(IpcError::Config {
                message: format!(
                    "message_capacity must be at least {} bytes",
                    IpcConfig::PIPE_BUFFER_SIZE
                ),
            });
        }
        self.socket_path().map(|_| ())
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}
