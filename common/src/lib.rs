//! Warden IPC Common Library
//!
//! Transport pieces shared by the Warden server and client:
//!
//! - A continuation-bit length prefix for framing
//! - Framed reads and writes over Unix stream sockets, with heartbeats
//! - Open descriptor passing (`SCM_RIGHTS`)
//! - A self-pipe cancellation signal that can sit in a `poll(2)` set
//! - Socket binding, peer credentials and shared defaults
//!
//! Payload encoding is pluggable through [`message::PayloadCodec`].

/// Shared defaults and environment lookups
pub mod config;

/// Error type for every transport layer
pub mod error;

/// Frames, heartbeats and descriptor passing
pub mod framed;

/// Variable-length frame prefix
pub mod length_codec;

/// Payload codecs and the demo message schema
pub mod message;

/// Cross-thread cancellation signal
pub mod notify_pipe;

/// Unix socket binding, connecting and peer credentials
pub mod platform_socket;

// Re-export commonly used types for convenience
pub use config::{socket_path_from_env, DEFAULT_SOCKET_PATH, SOCKET_PATH_ENV};
pub use error::{ErrorClass, IpcError, Result};
pub use framed::{FrameLength, FramedStream};
pub use message::{AgentMessage, BincodeCodec, CodecError, PayloadCodec};
pub use notify_pipe::{NotifyPipe, Readiness};
pub use platform_socket::ClientCredentials;
