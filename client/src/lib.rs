//! Warden IPC Client Library
//!
//! Connects to a Warden server over a Unix domain socket, retrying with a
//! cancellable back-off, and exchanges length-prefixed request/response frames.
//! A request may pass an open file descriptor to the server.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use warden_client::{ClientConfig, ClientConnection};
//!
//! # fn main() -> warden_common::Result<()> {
//! let config = ClientConfig::new()
//!     .with_socket_path("/tmp/warden.sock")
//!     .with_timeout(Duration::from_secs(10));
//!
//! let mut client = ClientConnection::new(config);
//! client.connect()?;
//!
//! let response = client.request(b"status", None)?;
//! println!("Server replied with {} bytes", response.len());
//!
//! client.disconnect();
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::*;
// Re-export important types from warden-common for convenience
pub use warden_common::{AgentMessage, IpcError, NotifyPipe, SOCKET_PATH_ENV};
