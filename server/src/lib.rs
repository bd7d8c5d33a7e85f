//! Warden IPC Server Library
//!
//! A Unix domain socket server that serves every accepted connection on its
//! own thread. Requests are length-prefixed frames, optionally accompanied by
//! a passed descriptor; what they mean is decided by a [`RequestHandler`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use warden_server::{HandlerReply, Request, RequestHandler, ServerConfig, ServerSocket};
//!
//! # fn main() -> warden_common::Result<()> {
//! let factory = |_: &warden_server::PeerInfo| -> Box<dyn RequestHandler> {
//!     Box::new(|request: Request| HandlerReply::success(request.payload))
//! };
//! let mut server = ServerSocket::bind(
//!     ServerConfig::new().with_socket_path("/tmp/echo.sock"),
//!     Arc::new(factory),
//! )?;
//!
//! let stop = server.stop_handle();
//! std::thread::spawn(move || {
//!     std::thread::sleep(std::time::Duration::from_secs(10));
//!     stop.notify();
//! });
//! server.run()?;
//! # Ok(())
//! # }
//! ```

/// Handler for the demo agent protocol
pub mod agent;

/// Request handler, factory and hook traits
pub mod handler;

/// Peer identity and uid policy
pub mod peer_creds;

mod socket_server;
mod worker;

pub use agent::{AgentHandler, AgentHandlerFactory};
pub use handler::{
    DefaultHooks, HandlerFactory, HandlerOutcome, HandlerReply, Request, RequestHandler,
    ServerHooks,
};
pub use peer_creds::{PeerInfo, PeerPolicy};
pub use socket_server::{ServerConfig, ServerSocket, ServerState, StopHandle};
pub use worker::WorkerExit;
