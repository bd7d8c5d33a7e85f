use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warden_common::config::{DEFAULT_MAX_CONNECTIONS, DEFAULT_READ_TIMEOUT};
use warden_server::{AgentHandlerFactory, PeerPolicy, ServerConfig, ServerSocket};

#[derive(Parser)]
#[command(name = "warden-server")]
#[command(about = "Warden IPC daemon")]
struct Args {
    /// Socket path (defaults to $WARDEN_SOCKET_PATH, then /tmp/warden.sock)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Permission bits for the socket, in octal
    #[arg(long, default_value = "600", value_parser = parse_mode)]
    mode: u32,

    /// Connections served at once; further ones are closed on accept
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Seconds a started request may take to arrive
    #[arg(long, default_value_t = DEFAULT_READ_TIMEOUT.as_secs())]
    read_timeout: u64,

    /// Only accept peers running as this uid (repeatable)
    #[arg(long = "allow-uid")]
    allow_uids: Vec<u32>,

    /// Only accept peers running as our own user (or the sudo invoker)
    #[arg(long)]
    same_user: bool,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn parse_mode(value: &str) -> Result<u32> {
    let mode = u32::from_str_radix(value.trim_start_matches("0o"), 8)
        .with_context(|| format!("'{value}' is not an octal mode"))?;
    if mode > 0o777 {
        return Err(anyhow!("mode {value} has bits outside 0o777"));
    }
    Ok(mode)
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    info!("Starting warden server...");
    // SAFETY: getuid() is always safe to call - returns the real user ID
    if unsafe { libc::getuid() } == 0 {
        warn!("Server running as root; passed files are read with root privileges");
    }

    let mut policy = if args.same_user {
        PeerPolicy::same_user()
    } else {
        PeerPolicy::AllowAll
    };
    if !args.allow_uids.is_empty() {
        policy = policy.allowing(args.allow_uids);
    }

    let mut config = ServerConfig::new()
        .with_mode(args.mode)
        .with_max_connections(args.max_connections)
        .with_read_timeout(Duration::from_secs(args.read_timeout))
        .with_peer_policy(policy);
    if let Some(socket) = args.socket {
        config = config.with_socket_path(socket);
    }

    let socket_path = config.socket_path.clone();
    let mut server = ServerSocket::bind(config, Arc::new(AgentHandlerFactory))
        .with_context(|| format!("Failed to bind to socket: {}", socket_path.display()))?;

    let stop = server.stop_handle();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping server...");
        stop.notify();
    })
    .context("Failed to set signal handler")?;

    server.run().context("Server error")?;
    info!("Server stopped");
    Ok(())
}
