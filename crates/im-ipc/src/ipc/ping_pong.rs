//! Liveness supervision between user-mode workers and the server.
//!
//! The server answers `ping` with a token generated once per process. Workers
//! ping every second; if the server stops answering, or answers with another
//! token because it restarted, the worker is orphaned and exits.

use super::client::IpcClient;
use super::handler::IpcHandler;
use super::server::IpcServer;
use crate::config::IpcConfig;
use crate::error::Result;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// Token identifying this process instance.
pub fn generation_token() -> &'static str {
    static TOKEN: OnceLock<String> = OnceLock::new();
    TOKEN.get_or_init(|| uuid::Uuid::new_v4().to_string())
}

/// Server and client halves of the ping-pong protocol.
pub struct IpcPingPong {
    server: Option<Arc<IpcServer>>,
    client: Option<Arc<dyn IpcClient>>,
}

impl IpcPingPong {
    pub fn new(server: Option<Arc<IpcServer>>, client: Option<Arc<dyn IpcClient>>) -> Self {
        Self { server, client }
    }

    /// Answer `ping` on the server, if there is one.
    pub fn register(&self) -> Result<()> {
        let Some(server) = &self.server else {
            return Ok(());
        };
        server.add_handler(IpcHandler::new(IpcConfig::PING_METHOD, |_, _| async {
            Ok(json!({ "generation": generation_token() }))
        }))
    }

    /// Start supervising the server connection, if there is a client.
    ///
    /// The process exits once the server is considered gone.
    pub fn start(&self) -> Option<tokio::task::JoinHandle<()>> {
        let client = self.client.clone()?;
        Some(tokio::spawn(async move {
            LivenessMonitor::new(client).run().await;
            error!("IPC ping-pong failed, shutting down, server no longer active");
            std::process::exit(1);
        }))
    }
}

/// Counts failed pings against the server.
pub struct LivenessMonitor {
    client: Arc<dyn IpcClient>,
    interval: Duration,
    timeout: Duration,
    threshold: u32,
    generation: Option<String>,
    failures: u32,
}

impl LivenessMonitor {
    pub fn new(client: Arc<dyn IpcClient>) -> Self {
        Self {
            client,
            interval: IpcConfig::PING_INTERVAL,
            timeout: IpcConfig::PING_TIMEOUT,
            threshold: IpcConfig::PING_FAILURE_THRESHOLD,
            generation: None,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Token of the server this monitor first saw.
    pub fn generation(&self) -> Option<&str> {
        self.generation.as_deref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.failures >= self.threshold
    }

    /// Ping once and update the failure count.
    ///
    /// A ping left unanswered for the ping timeout counts as a failure.
    /// Failures are never forgiven.
    pub async fn tick(&mut self) {
        let ping = self.client.call(IpcConfig::PING_METHOD, json!({}));
        let Ok(outcome) = tokio::time::timeout(self.timeout, ping).await else {
            self.failures += 1;
            warn!(
                "IPC ping timed out after {:?} ({}/{})",
                self.timeout, self.failures, self.threshold
            );
            return;
        };
        match outcome {
            Ok(reply) => match reply.get("generation").and_then(Value::as_str) {
                Some(token) => match &self.generation {
                    None => {
                        debug!("IPC server generation is {}", token);
                        self.generation = Some(token.to_string());
                    }
                    Some(known) if known == token => {}
                    Some(known) => {
                        self.failures += 1;
                        warn!(
                            "IPC server generation changed from {} to {} ({}/{})",
                            known, token, self.failures, self.threshold
                        );
                    }
                },
                None => {
                    self.failures += 1;
                    warn!(
                        "IPC ping reply has no generation ({}/{})",
                        self.failures, self.threshold
                    );
                }
            },
            Err(e) => {
                self.failures += 1;
                warn!("IPC ping failed ({}/{}): {}", self.failures, self.threshold, e);
            }
        }
    }

    /// Ping on a fixed interval until the failure threshold is reached.
    pub async fn run(&mut self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while !self.is_exhausted() {
            interval.tick().await;
            self.tick().await;
        }
    }
}
