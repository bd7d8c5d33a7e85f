//! The seams a server is configured with: how requests are answered, and what
//! happens on events the transport cannot resolve by itself.

use std::os::fd::OwnedFd;

use crate::peer_creds::PeerInfo;

/// One request as read off a connection.
#[derive(Debug)]
pub struct Request {
    pub payload:    Vec<u8>,
    /// Descriptor passed alongside the frame, when the protocol carries one.
    pub descriptor: Option<OwnedFd>,
}

/// How serving a request went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success,
    /// The request failed but the connection stays usable; the reply payload
    /// is still sent.
    RecoverableFailure(String),
    /// The handler hit a defect it cannot recover from. Nothing is sent and
    /// [`ServerHooks::on_fatal`] runs.
    FatalFailure(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerReply {
    pub payload: Vec<u8>,
    pub outcome: HandlerOutcome,
}

impl HandlerReply {
    pub fn success(payload: Vec<u8>) -> Self {
        Self {
            payload,
            outcome: HandlerOutcome::Success,
        }
    }

    pub fn recoverable(payload: Vec<u8>, reason: impl Into<String>) -> Self {
        Self {
            payload,
            outcome: HandlerOutcome::RecoverableFailure(reason.into()),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            payload: Vec::new(),
            outcome: HandlerOutcome::FatalFailure(reason.into()),
        }
    }
}

/// Serves the requests of a single connection. Requests arrive strictly one
/// after another.
pub trait RequestHandler: Send {
    fn handle(&mut self, request: Request) -> HandlerReply;

    /// Whether every request is preceded by a passed descriptor. Heartbeats
    /// may still arrive ahead of the descriptor or between it and its frame.
    fn leading_descriptor(&self) -> bool {
        false
    }

    /// Whether a passed descriptor follows the frame holding `payload`.
    fn trailing_descriptor(&mut self, payload: &[u8]) -> bool {
        let _ = payload;
        false
    }
}

impl<F> RequestHandler for F
where
    F: FnMut(Request) -> HandlerReply + Send,
{
    fn handle(&mut self, request: Request) -> HandlerReply {
        self(request)
    }
}

/// Builds a fresh [`RequestHandler`] for every accepted connection.
pub trait HandlerFactory: Send + Sync {
    fn create(&self, peer: &PeerInfo) -> Box<dyn RequestHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn(&PeerInfo) -> Box<dyn RequestHandler> + Send + Sync,
{
    fn create(&self, peer: &PeerInfo) -> Box<dyn RequestHandler> {
        self(peer)
    }
}

/// Server-wide reactions to events outside any single request.
pub trait ServerHooks: Send + Sync {
    /// A connection was accepted and closed because `limit` were already live.
    fn on_max_connections(&self, limit: usize) {
        tracing::warn!(limit, "Connection limit reached");
    }

    /// A handler reported [`HandlerOutcome::FatalFailure`].
    fn on_fatal(&self, reason: &str);
}

/// Logs and terminates the process on a fatal handler failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl ServerHooks for DefaultHooks {
    fn on_fatal(&self, reason: &str) {
        tracing::error!(reason, "Fatal handler failure, terminating");
        std::process::exit(1);
    }
}
