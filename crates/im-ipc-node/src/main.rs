//! IM IPC Node - server, user and diagnostic entry points for the IPC transport.
//!
//! `server` owns the socket and answers pings. `user` connects as a worker and
//! exits once the server it started with goes away. `call` performs a single
//! request and prints the result.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use im_ipc::{IpcClient, IpcConfig, IpcPingPong, IpcServer, IpcSettings, RealIpcClient};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "im-ipc-node")]
#[command(about = "Unix-socket IPC node for the integration module")]
struct Args {
    /// Directory holding the IPC socket
    #[arg(long, env = "IM_IPC_DIRECTORY", default_value = IpcConfig::DEFAULT_DIRECTORY)]
    ipc_directory: PathBuf,

    /// Connections served concurrently (server mode)
    #[arg(long, default_value_t = IpcConfig::DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run the IPC server until interrupted
    Server,
    /// Connect as a user-mode worker and supervise the server connection
    User,
    /// Send one request and print its result as JSON
    Call {
        method: String,
        /// Request params as a JSON document
        #[arg(default_value = "{}")]
        params: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let settings = IpcSettings {
        directory: args.ipc_directory,
        max_connections: args.max_connections,
        ..IpcSettings::default()
    };
    settings.validate()?;

    match args.mode {
        Mode::Server => run_server(settings).await,
        Mode::User => run_user(settings).await,
        Mode::Call { method, params } => run_call(settings, &method, &params).await,
    }
}

async fn run_server(settings: IpcSettings) -> Result<()> {
    info!("Starting IPC server in {}", settings.directory().display());

    let server = Arc::new(IpcServer::new(settings));
    IpcPingPong::new(Some(server.clone()), None).register()?;

    let mut handle = server.start().await?;
    info!("IPC server running on {}", handle.socket_path().display());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    handle.shutdown();
    handle.wait().await?;

    Ok(())
}

async fn connect(settings: &IpcSettings) -> Result<Arc<RealIpcClient>> {
    let client = RealIpcClient::new(settings)?;
    client
        .connect()
        .await
        .with_context(|| format!("Could not connect to IPC server in {}", settings.directory().display()))?;
    Ok(Arc::new(client))
}

async fn run_user(settings: IpcSettings) -> Result<()> {
    let client = connect(&settings).await?;
    info!("Connected to IPC server as uid {}", im_ipc::IpcUser::current_process().uid);

    let ping_pong = IpcPingPong::new(None, Some(client));
    let Some(supervisor) = ping_pong.start() else {
        return Ok(());
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received, exiting");
        }
        result = supervisor => {
            result.context("IPC supervisor task failed")?;
        }
    }

    Ok(())
}

async fn run_call(settings: IpcSettings, method: &str, params: &str) -> Result<()> {
    let params: Value = serde_json::from_str(params).context("params must be a JSON document")?;
    let client = connect(&settings).await?;

    let result = client.call(method, params).await?;

    // Intentional stdout: the result is the command's output
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
