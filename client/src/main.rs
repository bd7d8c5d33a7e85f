use std::{
    fs::File,
    os::fd::{AsFd, BorrowedFd},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use warden_client::{ClientConfig, ClientConnection, NotifySleep, RetryPolicy};
use warden_common::{
    config::{DEFAULT_CONNECT_ATTEMPTS, DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRY_DELAY},
    AgentMessage, BincodeCodec, NotifyPipe, PayloadCodec,
};

#[derive(Parser)]
#[command(name = "warden-client")]
#[command(about = "Warden IPC Client")]
struct Args {
    /// Socket path (defaults to $WARDEN_SOCKET_PATH, then /tmp/warden.sock)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Connection attempts before giving up
    #[arg(long, default_value_t = DEFAULT_CONNECT_ATTEMPTS)]
    attempts: u32,

    /// Seconds to wait for each response
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT.as_secs())]
    timeout: u64,

    #[arg(short, long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the server is alive
    Ping,
    /// Have the server hash a file opened by this process
    Scan {
        /// File to pass to the server
        file: PathBuf,
    },
}

type AgentClient = ClientConnection<NotifySleep>;

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    // Check that we're not running as root (for security)
    // SAFETY: getuid() is always safe to call - returns the real user ID
    if unsafe { libc::getuid() } == 0 {
        eprintln!("Warning: client is running as root");
    }

    let interrupted = Arc::new(NotifyPipe::new().context("Failed to create signal pipe")?);
    {
        let interrupted = interrupted.clone();
        ctrlc::set_handler(move || interrupted.notify())
            .context("Failed to set signal handler")?;
    }

    let mut config = ClientConfig::new()
        .with_retry(RetryPolicy {
            max_attempts: args.attempts,
            delay:        DEFAULT_RETRY_DELAY,
        })
        .with_timeout(Duration::from_secs(args.timeout));
    if let Some(socket) = args.socket {
        config = config.with_socket_path(socket);
    }

    let mut client = ClientConnection::with_sleeper(config, NotifySleep::new(interrupted));
    client.connect().with_context(|| {
        format!("Failed to connect to server at {}", client.socket_path().display())
    })?;

    match args.command {
        Commands::Ping => match exchange(&mut client, &AgentMessage::Ping, None)? {
            AgentMessage::Pong => println!("pong"),
            AgentMessage::Error { message, .. } => bail!("Server returned error for ping: {message}"),
            other => bail!("Expected pong, got: {other:?}"),
        },

        Commands::Scan { file } => {
            let handle = File::open(&file)
                .with_context(|| format!("Failed to open {}", file.display()))?;
            let request = AgentMessage::ScanRequest {
                id:   1,
                path: file.display().to_string(),
            };
            match exchange(&mut client, &request, Some(handle.as_fd()))? {
                AgentMessage::ScanVerdict { size, sha256, .. } => {
                    println!("{sha256}  {} ({size} bytes)", file.display());
                }
                AgentMessage::Error { message, .. } => bail!("Scan failed: {message}"),
                other => bail!("Expected scan verdict, got: {other:?}"),
            }
        }
    }

    info!(requests = client.stats().requests_sent, "Done");
    client.disconnect();
    Ok(())
}

fn exchange(
    client: &mut AgentClient,
    message: &AgentMessage,
    descriptor: Option<BorrowedFd<'_>>,
) -> Result<AgentMessage> {
    let codec = BincodeCodec::<AgentMessage>::new();
    let payload = codec.encode(message).context("Failed to encode request")?;
    let response = client
        .request(&payload, descriptor)
        .context("Request failed")?;
    codec.decode(&response).context("Failed to decode response")
}
