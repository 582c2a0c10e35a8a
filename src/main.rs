//! srpc: per-connection JSON-RPC session host
//!
//! Accepts WebSocket connections, negotiates a protocol version with each
//! client, and gives every connection its own isolated set of local targets.
//!
//! Usage:
//!   srpc                                     # Default port 7070, protocol 1.0
//!   srpc --port 8080                         # Custom port
//!   srpc --protocol-version 1.4 --min-version 1.2
//!   srpc --token mysecret                    # Require a token in the handshake

mod targets;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use srpc_host::{HostConfig, HostError, LifecycleDispatcher, RpcHost};
use srpc_protocol::ProtocolVersion;
use srpc_transport::TransportConfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "srpc", about = "srpc: per-connection JSON-RPC session host")]
struct Cli {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, default_value = "7070")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// Protocol version this server speaks
    #[arg(long, default_value = "1.0")]
    protocol_version: String,

    /// Oldest client protocol version accepted
    #[arg(long)]
    min_version: Option<String>,

    /// Token clients must present in the handshake
    #[arg(long)]
    token: Option<String>,

    /// Maximum concurrent connections
    #[arg(long, default_value = "32")]
    max_connections: usize,

    /// Milliseconds to wait for connections to drain on shutdown (negative waits forever)
    #[arg(long, default_value = "30000", allow_negative_numbers = true)]
    shutdown_timeout_ms: i64,

    /// Enable permissive CORS on the HTTP endpoints
    #[arg(long)]
    cors: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Write logs to a file (defaults to ~/.srpc/logs/srpc.log if no path given)
    #[arg(long, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,
}

fn init_tracing(verbose: bool, log_file: Option<&str>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let Some(log_file) = log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(());
    };

    let log_path = if log_file == "DEFAULT" {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".srpc/logs/srpc.log")
    } else {
        PathBuf::from(log_file)
    };
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open log file {}", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();

    eprintln!("Logging to {}", log_path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_file.as_deref())?;

    let config = HostConfig {
        transport: TransportConfig {
            port: cli.port,
            hostname: cli.hostname.clone(),
            server_version: ProtocolVersion::parse(&cli.protocol_version),
            min_client_version: cli.min_version.as_deref().map(ProtocolVersion::parse),
            token: cli.token.clone(),
            enable_cors: cli.cors,
            max_connections: Some(cli.max_connections),
            ..TransportConfig::default()
        },
        shutdown_timeout_ms: cli.shutdown_timeout_ms,
    };
    if !config.transport.server_version.is_parsed() {
        anyhow::bail!("invalid --protocol-version '{}'", cli.protocol_version);
    }

    let mut dispatcher = LifecycleDispatcher::new();
    targets::register(&mut dispatcher);

    let host = RpcHost::new(config, dispatcher);
    host.start().await.context("failed to start host")?;
    let port = host.port().unwrap_or(cli.port);

    println!("────────────────────────────────────────────────────────────────");
    println!();
    println!("  srpc running!");
    println!();
    println!("  WebSocket endpoint:");
    println!("    ws://{}:{port}/ws", cli.hostname);
    println!();
    println!("  Protocol version:");
    println!("    {}", host.config().transport.server_version);
    if cli.token.is_some() {
        println!();
        println!("  Handshake token required.");
    }
    println!();
    println!("────────────────────────────────────────────────────────────────");
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    let shutdown = host.shutdown_token();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = shutdown.cancelled() => {}
    }

    println!();
    println!("  Shutting down...");
    match host.stop(host.config().shutdown_timeout()).await {
        Ok(()) => info!("shutdown complete"),
        Err(HostError::ShutdownIncomplete { pending }) => {
            warn!(pending, "exiting with connections still tearing down");
        }
        Err(e) => return Err(e.into()),
    }

    println!("  Server stopped.");
    Ok(())
}
