//! One thread per accepted connection.

use std::{
    os::fd::{AsFd, OwnedFd},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use uuid::Uuid;
use warden_common::{FrameLength, FramedStream, IpcError, NotifyPipe, Readiness, Result};

use crate::{
    handler::{HandlerOutcome, Request, RequestHandler, ServerHooks},
    peer_creds::PeerInfo,
};

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The peer closed the connection between requests.
    Eof,
    /// The peer broke the framing or descriptor protocol, or the transport failed.
    ProtocolError,
    /// The server asked the worker to stop.
    Cancelled,
    /// The handler failed fatally or its reply could not be delivered.
    HandlerFault,
}

/// The accept loop's grip on a running worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    id:     Uuid,
    stop:   Arc<NotifyPipe>,
    thread: JoinHandle<WorkerExit>,
}

impl WorkerHandle {
    pub(crate) fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Ask the worker to stop at its next wait.
    pub(crate) fn stop(&self) {
        self.stop.notify();
    }

    pub(crate) fn join(self) -> WorkerExit {
        match self.thread.join() {
            Ok(exit) => exit,
            Err(_) => {
                tracing::error!(conn = %self.id, "Connection worker panicked");
                WorkerExit::HandlerFault
            }
        }
    }
}

/// Serves requests on one connection until it ends or is cancelled.
pub(crate) struct ConnectionWorker {
    conn:             FramedStream,
    peer:             PeerInfo,
    handler:          Box<dyn RequestHandler>,
    hooks:            Arc<dyn ServerHooks>,
    stop:             Arc<NotifyPipe>,
    read_timeout:     Duration,
    heartbeat_logged: bool,
    /// Leading descriptor received, waiting for its frame.
    leading:          Option<OwnedFd>,
}

impl ConnectionWorker {
    pub(crate) fn new(
        conn: FramedStream,
        peer: PeerInfo,
        handler: Box<dyn RequestHandler>,
        hooks: Arc<dyn ServerHooks>,
        read_timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            conn,
            peer,
            handler,
            hooks,
            stop: Arc::new(NotifyPipe::new()?),
            read_timeout,
            heartbeat_logged: false,
            leading:          None,
        })
    }

    /// Start serving on a dedicated thread.
    pub(crate) fn spawn(self) -> Result<WorkerHandle> {
        let id = self.peer.connection_id;
        let stop = Arc::clone(&self.stop);
        let thread = thread::Builder::new()
            .name(format!("warden-conn-{}", id.simple()))
            .spawn(move || {
                let span = tracing::info_span!("connection", conn = %id);
                let _guard = span.enter();
                self.run()
            })
            .map_err(IpcError::Io)?;

        Ok(WorkerHandle { id, stop, thread })
    }

    pub(crate) fn run(mut self) -> WorkerExit {
        tracing::debug!(pid = ?self.peer.pid(), uid = ?self.peer.uid(), "Worker started");

        let exit = loop {
            match self.stop.wait_with(self.conn.as_fd(), None) {
                Ok(Readiness::Cancelled) => break WorkerExit::Cancelled,
                Ok(Readiness::TimedOut) => continue,
                Ok(Readiness::Ready) => {}
                Err(e) => {
                    tracing::error!("Wait on connection failed: {}", e);
                    break WorkerExit::ProtocolError;
                }
            }

            if let Some(exit) = self.serve_one() {
                break exit;
            }
        };

        match exit {
            WorkerExit::Eof => tracing::info!("Client disconnected"),
            WorkerExit::Cancelled => tracing::info!("Connection closed on shutdown"),
            other => tracing::warn!(exit = ?other, "Connection dropped"),
        }
        exit
    }

    /// Read, handle and answer one request. `None` means keep going.
    fn serve_one(&mut self) -> Option<WorkerExit> {
        if self.handler.leading_descriptor() && self.leading.is_none() {
            match self.conn.receive_leading_descriptor() {
                Ok(Some(fd)) => self.leading = Some(fd),
                Ok(None) => self.note_heartbeat(),
                Err(e) => return Some(protocol_failure("leading descriptor", &e)),
            }
            return None;
        }

        let length = match self.conn.read_length() {
            Ok(FrameLength::Eof) => return Some(WorkerExit::Eof),
            Ok(FrameLength::Heartbeat) => {
                self.note_heartbeat();
                return None;
            }
            Ok(FrameLength::Bytes(n)) => n,
            Err(e) => return Some(protocol_failure("frame length", &e)),
        };

        let payload = match self.conn.read_payload(length, self.read_timeout) {
            Ok(payload) => payload,
            Err(e) => return Some(protocol_failure("frame payload", &e)),
        };
        tracing::trace!(bytes = length, "Request received");

        let descriptor = match self.descriptor_for(&payload) {
            Ok(descriptor) => descriptor,
            Err(e) => return Some(protocol_failure("trailing descriptor", &e)),
        };

        let reply = self.handler.handle(Request {
            payload,
            descriptor,
        });

        match &reply.outcome {
            HandlerOutcome::Success => {}
            HandlerOutcome::RecoverableFailure(reason) => {
                tracing::warn!(reason = %reason, "Request failed");
            }
            HandlerOutcome::FatalFailure(reason) => {
                tracing::error!(reason = %reason, "Handler failed fatally");
                self.hooks.on_fatal(reason);
                return Some(WorkerExit::HandlerFault);
            }
        }

        if let Err(e) = self.conn.write_frame(&reply.payload) {
            tracing::warn!("Failed to send response: {}", e);
            return Some(WorkerExit::HandlerFault);
        }
        None
    }

    fn note_heartbeat(&mut self) {
        if !self.heartbeat_logged {
            tracing::debug!("Heartbeat received, no new message");
            self.heartbeat_logged = true;
        }
    }

    fn descriptor_for(&mut self, payload: &[u8]) -> Result<Option<OwnedFd>> {
        if let Some(fd) = self.leading.take() {
            return Ok(Some(fd));
        }
        if self.handler.trailing_descriptor(payload) {
            return self.conn.receive_descriptor().map(Some);
        }
        Ok(None)
    }
}

fn protocol_failure(stage: &str, err: &IpcError) -> WorkerExit {
    if err.is_graceful() {
        return WorkerExit::Eof;
    }
    tracing::warn!(stage, class = ?err.class(), "Dropping connection: {}", err);
    WorkerExit::ProtocolError
}
