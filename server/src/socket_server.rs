use std::{
    fs, io,
    os::{fd::AsFd, unix::net::{UnixListener, UnixStream}},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use uuid::Uuid;
use warden_common::{
    config::{
        DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_FRAME_LENGTH, DEFAULT_READ_TIMEOUT,
        DEFAULT_SOCKET_MODE,
    },
    platform_socket::{bind_listener, peer_credentials},
    FramedStream, IpcError, NotifyPipe, Readiness, Result,
};

use crate::{
    handler::{DefaultHooks, HandlerFactory, ServerHooks},
    peer_creds::{PeerInfo, PeerPolicy},
    worker::{ConnectionWorker, WorkerHandle},
};

/// How often an idle accept loop wakes up to reap finished workers.
const REAP_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration for a [`ServerSocket`]
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Filesystem path of the listening socket
    pub socket_path:      PathBuf,
    /// Permission bits applied to the socket entry
    pub mode:             u32,
    /// Live connections beyond which new ones are closed right away
    pub max_connections:  usize,
    /// How long a started frame may take to arrive in full
    pub read_timeout:     Duration,
    /// How long a response write may block
    pub write_timeout:    Duration,
    pub max_frame_length: usize,
    /// Which peer users may connect
    pub peer_policy:      PeerPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path:      warden_common::socket_path_from_env(),
            mode:             DEFAULT_SOCKET_MODE,
            max_connections:  DEFAULT_MAX_CONNECTIONS,
            read_timeout:     DEFAULT_READ_TIMEOUT,
            write_timeout:    DEFAULT_READ_TIMEOUT,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            peer_policy:      PeerPolicy::AllowAll,
        }
    }
}

impl ServerConfig {
    /// Creates a server configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_socket_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn with_peer_policy(mut self, policy: PeerPolicy) -> Self {
        self.peer_policy = policy;
        self
    }
}

/// Lifecycle of a [`ServerSocket`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unbound,
    Listening,
    ShuttingDown,
    Closed,
}

/// Cloneable handle that stops a running [`ServerSocket`].
pub type StopHandle = Arc<NotifyPipe>;

/// A listening Unix socket that serves each connection on its own worker thread.
pub struct ServerSocket {
    config:   ServerConfig,
    factory:  Arc<dyn HandlerFactory>,
    hooks:    Arc<dyn ServerHooks>,
    stop:     StopHandle,
    listener: Option<UnixListener>,
    workers:  Vec<WorkerHandle>,
    state:    ServerState,
}

impl ServerSocket {
    /// Create an unbound server. Nothing touches the filesystem until
    /// [`listen`](Self::listen) or [`run`](Self::run).
    pub fn new(config: ServerConfig, factory: Arc<dyn HandlerFactory>) -> Result<Self> {
        Ok(Self {
            config,
            factory,
            hooks: Arc::new(DefaultHooks),
            stop: Arc::new(NotifyPipe::new()?),
            listener: None,
            workers: Vec::new(),
            state: ServerState::Unbound,
        })
    }

    /// Create a server and bind it right away.
    pub fn bind(config: ServerConfig, factory: Arc<dyn HandlerFactory>) -> Result<Self> {
        let mut server = Self::new(config, factory)?;
        server.listen()?;
        Ok(server)
    }

    /// Replace the default hooks, which exit the process on a fatal handler
    /// failure.
    pub fn with_hooks(mut self, hooks: Arc<dyn ServerHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Bind the socket path. On failure no descriptor and no path entry remain.
    pub fn listen(&mut self) -> Result<()> {
        if self.state != ServerState::Unbound {
            return Ok(());
        }
        let listener = bind_listener(&self.config.socket_path, self.config.mode)?;
        tracing::info!(
            path = %self.config.socket_path.display(),
            mode = %format!("{:o}", self.config.mode),
            "Server bound"
        );
        self.listener = Some(listener);
        self.state = ServerState::Listening;
        Ok(())
    }

    pub fn stop_handle(&self) -> StopHandle {
        Arc::clone(&self.stop)
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Workers that have not been reaped yet.
    pub fn live_connections(&self) -> usize {
        self.workers.len()
    }

    /// Accept and serve connections until the stop handle fires.
    ///
    /// Returns only after every worker has stopped and the socket path has
    /// been removed. An accept failure that is not transient ends the loop
    /// the same way and is returned.
    pub fn run(&mut self) -> Result<()> {
        self.listen()?;
        let Some(listener) = self.listener.take() else {
            return Err(IpcError::NotConnected);
        };

        tracing::info!(path = %self.config.socket_path.display(), "Accepting connections");
        let result = self.accept_loop(&listener);

        drop(listener);
        self.shutdown();
        result
    }

    fn accept_loop(&mut self, listener: &UnixListener) -> Result<()> {
        loop {
            match self.stop.wait_with(listener.as_fd(), Some(REAP_INTERVAL))? {
                Readiness::Cancelled => {
                    tracing::info!("Stop requested");
                    return Ok(());
                }
                Readiness::TimedOut => {
                    self.reap_finished();
                    continue;
                }
                Readiness::Ready => {}
            }

            match listener.accept() {
                Ok((stream, _)) => self.admit(stream),
                Err(e) if is_transient(&e) => continue,
                Err(e) => {
                    tracing::error!("Accept failed: {} (kind: {:?})", e, e.kind());
                    return Err(IpcError::Accept(e));
                }
            }
        }
    }

    fn admit(&mut self, stream: UnixStream) {
        self.reap_finished();

        let limit = self.config.max_connections;
        if self.workers.len() >= limit {
            drop(stream);
            self.hooks.on_max_connections(limit);
            return;
        }

        let peer = PeerInfo {
            connection_id: Uuid::new_v4(),
            credentials:   match peer_credentials(&stream) {
                Ok(credentials) => Some(credentials),
                Err(e) => {
                    tracing::warn!("Failed to read peer credentials: {}", e);
                    None
                }
            },
        };

        if !self.config.peer_policy.permits(&peer) {
            tracing::warn!(pid = ?peer.pid(), uid = ?peer.uid(), "Peer not allowed, closing connection");
            return;
        }

        if let Err(e) = self.start_worker(stream, peer) {
            tracing::error!(conn = %peer.connection_id, "Failed to start worker: {}", e);
        }
    }

    fn start_worker(&mut self, stream: UnixStream, peer: PeerInfo) -> Result<()> {
        // Accepted sockets inherit the listener's non-blocking flag on some platforms.
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(self.config.write_timeout))?;

        tracing::info!(
            conn = %peer.connection_id,
            pid = ?peer.pid(),
            uid = ?peer.uid(),
            "Client connected"
        );

        let conn = FramedStream::new(stream)
            .with_max_length(self.config.max_frame_length)
            .with_read_timeout(self.config.read_timeout);
        let handler = self.factory.create(&peer);
        let worker = ConnectionWorker::new(
            conn,
            peer,
            handler,
            Arc::clone(&self.hooks),
            self.config.read_timeout,
        )?;

        self.workers.push(worker.spawn()?);
        Ok(())
    }

    fn reap_finished(&mut self) {
        let (finished, live): (Vec<_>, Vec<_>) =
            self.workers.drain(..).partition(|w| w.is_finished());
        self.workers = live;
        for worker in finished {
            let exit = worker.join();
            tracing::trace!(exit = ?exit, "Reaped worker");
        }
    }

    fn shutdown(&mut self) {
        if matches!(self.state, ServerState::Unbound | ServerState::Closed) {
            return;
        }
        self.state = ServerState::ShuttingDown;

        for worker in &self.workers {
            worker.stop();
        }
        let stopped = self.workers.len();
        for worker in self.workers.drain(..) {
            worker.join();
        }
        self.listener = None;

        match fs::remove_file(&self.config.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.config.socket_path.display(),
                "Failed to remove socket: {}",
                e
            ),
        }

        self.state = ServerState::Closed;
        tracing::info!(workers = stopped, "Server closed");
    }
}

impl Drop for ServerSocket {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
    )
}
