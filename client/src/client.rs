use std::{
    io,
    os::fd::BorrowedFd,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use warden_common::{
    config::{
        DEFAULT_CONNECT_ATTEMPTS, DEFAULT_MAX_FRAME_LENGTH, DEFAULT_READ_TIMEOUT,
        DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRY_DELAY,
    },
    platform_socket::connect_stream,
    socket_path_from_env, FrameLength, FramedStream, IpcError, NotifyPipe, Result,
};

/// A sleep that can be cut short.
pub trait StoppableSleep {
    /// Sleep for `duration`. Returns `true` if the sleep was cancelled.
    fn sleep(&self, duration: Duration) -> bool;
}

/// Plain thread sleep; never cancelled.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleep;

impl StoppableSleep for ThreadSleep {
    fn sleep(&self, duration: Duration) -> bool {
        thread::sleep(duration);
        false
    }
}

/// Sleep that ends early once its [`NotifyPipe`] is signalled. The signal is
/// not consumed, so every later sleep is cancelled too.
#[derive(Debug, Clone)]
pub struct NotifySleep {
    pipe: Arc<NotifyPipe>,
}

impl NotifySleep {
    pub fn new(pipe: Arc<NotifyPipe>) -> Self {
        Self { pipe }
    }
}

impl StoppableSleep for NotifySleep {
    fn sleep(&self, duration: Duration) -> bool {
        match self.pipe.wait(Some(duration)) {
            Ok(signalled) => signalled,
            Err(e) => {
                tracing::warn!("Cancellable sleep failed, sleeping plainly: {}", e);
                thread::sleep(duration);
                false
            }
        }
    }
}

/// How hard [`ClientConnection::connect`] tries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts in total; zero is treated as one
    pub max_attempts: u32,
    /// Pause between failed attempts
    pub delay:        Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_CONNECT_ATTEMPTS,
            delay:        DEFAULT_RETRY_DELAY,
        }
    }
}

/// Configuration for the Warden IPC client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Socket path to connect to
    pub socket_path:      PathBuf,
    pub retry:            RetryPolicy,
    /// How long a request waits for its response
    pub timeout:          Duration,
    /// How long a response frame may take once it has started
    pub read_timeout:     Duration,
    pub max_frame_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path:      socket_path_from_env(),
            retry:            RetryPolicy::default(),
            timeout:          DEFAULT_REQUEST_TIMEOUT,
            read_timeout:     DEFAULT_READ_TIMEOUT,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ClientConfig {
    /// Creates a client configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the socket path
    pub fn with_socket_path<P: Into<PathBuf>>(mut self, socket_path: P) -> Self {
        self.socket_path = socket_path.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unconnected,
    Connecting,
    Connected,
    Closed,
}

/// Statistics about the client connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStats {
    pub state:         ClientState,
    pub socket_path:   PathBuf,
    pub requests_sent: u64,
}

/// A request/response connection to a Warden server
pub struct ClientConnection<S: StoppableSleep = ThreadSleep> {
    config:        ClientConfig,
    sleeper:       S,
    connection:    Option<FramedStream>,
    state:         ClientState,
    requests_sent: u64,
}

impl ClientConnection<ThreadSleep> {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_sleeper(config, ThreadSleep)
    }
}

impl<S: StoppableSleep> ClientConnection<S> {
    /// Use `sleeper` between connection attempts.
    pub fn with_sleeper(config: ClientConfig, sleeper: S) -> Self {
        Self {
            config,
            sleeper,
            connection: None,
            state: ClientState::Unconnected,
            requests_sent: 0,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Check if client is connected to the server
    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    /// A single connection attempt.
    pub fn connect_once(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        self.state = ClientState::Connecting;
        match connect_stream(&self.config.socket_path) {
            Ok(stream) => {
                self.connection = Some(
                    FramedStream::new(stream)
                        .with_max_length(self.config.max_frame_length)
                        .with_read_timeout(self.config.read_timeout),
                );
                self.state = ClientState::Connected;
                tracing::info!(path = %self.config.socket_path.display(), "Connected");
                Ok(())
            }
            Err(source) => {
                self.state = ClientState::Unconnected;
                Err(IpcError::Connect {
                    path: self.config.socket_path.clone(),
                    source,
                })
            }
        }
    }

    /// Attempt to connect up to `max_attempts` times, sleeping between
    /// failures. A cancelled sleep ends the loop with [`IpcError::Cancelled`].
    pub fn connect_with_retries(&mut self, max_attempts: u32) -> Result<()> {
        let attempts = max_attempts.max(1);
        let mut last_failure: Option<io::ErrorKind> = None;

        for attempt in 1..=attempts {
            match self.connect_once() {
                Ok(()) => return Ok(()),
                Err(IpcError::Connect { source, .. }) => {
                    if last_failure == Some(source.kind()) {
                        tracing::debug!(attempt, "Connect failed again: {}", source);
                    } else {
                        tracing::warn!(
                            attempt,
                            path = %self.config.socket_path.display(),
                            "Failed to connect: {}",
                            source
                        );
                        last_failure = Some(source.kind());
                    }
                }
                Err(e) => return Err(e),
            }

            if attempt < attempts && self.sleeper.sleep(self.config.retry.delay) {
                tracing::info!(attempt, "Connect cancelled");
                return Err(IpcError::Cancelled);
            }
        }

        Err(IpcError::RetriesExhausted {
            path: self.config.socket_path.clone(),
            attempts,
        })
    }

    /// Connect using the configured [`RetryPolicy`].
    pub fn connect(&mut self) -> Result<()> {
        self.connect_with_retries(self.config.retry.max_attempts)
    }

    /// Send `payload`, followed by `descriptor` when given, and wait for the
    /// response. Heartbeats from the server are skipped. Any failure closes
    /// the connection.
    pub fn request(&mut self, payload: &[u8], descriptor: Option<BorrowedFd<'_>>) -> Result<Vec<u8>> {
        let result = self.exchange(payload, descriptor);
        match &result {
            Ok(_) => self.requests_sent += 1,
            Err(e) => {
                tracing::warn!(class = ?e.class(), "Request failed: {}", e);
                self.close();
            }
        }
        result
    }

    fn exchange(&self, payload: &[u8], descriptor: Option<BorrowedFd<'_>>) -> Result<Vec<u8>> {
        let conn = self.connection.as_ref().ok_or(IpcError::NotConnected)?;

        conn.write_frame(payload)?;
        if let Some(fd) = descriptor {
            conn.send_descriptor(fd)?;
        }

        let deadline = Instant::now() + self.config.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !conn.poll_readable(remaining)? {
                return Err(IpcError::Timeout(self.config.timeout));
            }
            match conn.read_length()? {
                FrameLength::Eof => return Err(IpcError::PeerClosed),
                FrameLength::Heartbeat => continue,
                FrameLength::Bytes(n) => return conn.read_payload(n, self.config.read_timeout),
            }
        }
    }

    /// Tell the server we are still here.
    pub fn send_heartbeat(&mut self) -> Result<()> {
        let conn = self.connection.as_ref().ok_or(IpcError::NotConnected)?;
        if let Err(e) = conn.send_heartbeat() {
            self.close();
            return Err(e);
        }
        Ok(())
    }

    /// Disconnect from the server
    pub fn disconnect(&mut self) {
        if self.connection.is_some() {
            tracing::debug!(path = %self.config.socket_path.display(), "Disconnecting");
            self.close();
        }
    }

    fn close(&mut self) {
        self.connection = None;
        self.state = ClientState::Closed;
    }

    /// Get connection and usage statistics
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            state:         self.state,
            socket_path:   self.config.socket_path.clone(),
            requests_sent: self.requests_sent,
        }
    }
}

impl<S: StoppableSleep> Drop for ClientConnection<S> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs::File,
        io::{Read, Seek, SeekFrom, Write},
        os::{fd::AsFd, unix::net::UnixListener},
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    /// Counts sleeps and reports cancellation from the `cancel_at`-th one on.
    #[derive(Default)]
    struct CountingSleep {
        calls:     AtomicUsize,
        cancel_at: Option<usize>,
    }

    impl StoppableSleep for CountingSleep {
        fn sleep(&self, _duration: Duration) -> bool {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.cancel_at.is_some_and(|at| call >= at)
        }
    }

    fn config(path: &Path) -> ClientConfig {
        ClientConfig::new()
            .with_socket_path(path)
            .with_retry(RetryPolicy {
                max_attempts: 3,
                delay:        Duration::from_millis(1),
            })
            .with_timeout(Duration::from_secs(2))
    }

    /// Accept one connection and answer each frame with `respond(payload, fd)`.
    fn serve_one<F>(listener: UnixListener, with_fd: bool, respond: F) -> thread::JoinHandle<()>
    where
        F: Fn(Vec<u8>, Option<File>) -> Vec<u8> + Send + 'static,
    {
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let conn = FramedStream::new(stream);
            loop {
                let n = match conn.read_length().unwrap() {
                    FrameLength::Bytes(n) => n,
                    FrameLength::Heartbeat => continue,
                    FrameLength::Eof => break,
                };
                let payload = conn.read_payload(n, Duration::from_secs(1)).unwrap();
                let file = with_fd.then(|| File::from(conn.receive_descriptor().unwrap()));
                conn.send_heartbeat().unwrap();
                conn.write_frame(&respond(payload, file)).unwrap();
            }
        })
    }

    /// A bound listener that never accepts still completes `connect` through
    /// its backlog, so a path with no listener stands in for the refusing peer.
    #[test_log::test]
    fn missing_listener_exhausts_retries_after_two_sleeps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock");
        let mut client = ClientConnection::with_sleeper(config(&path), CountingSleep::default());

        let err = client.connect().unwrap_err();
        assert!(matches!(err, IpcError::RetriesExhausted { attempts: 3, .. }), "{err:?}");
        assert_eq!(client.sleeper().calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.state(), ClientState::Unconnected);
    }

    #[test]
    fn cancelled_sleep_aborts_the_retry_loop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock");
        let sleeper = CountingSleep {
            cancel_at: Some(1),
            ..Default::default()
        };
        let mut client = ClientConnection::with_sleeper(config(&path), sleeper);

        assert!(matches!(client.connect_with_retries(10), Err(IpcError::Cancelled)));
        assert_eq!(client.sleeper().calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock");
        let mut client = ClientConnection::with_sleeper(config(&path), CountingSleep::default());

        assert!(matches!(
            client.connect_with_retries(0),
            Err(IpcError::RetriesExhausted { attempts: 1, .. })
        ));
        assert_eq!(client.sleeper().calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn notify_sleep_is_cut_short_by_the_signal() {
        let pipe = Arc::new(NotifyPipe::new().unwrap());
        let sleeper = NotifySleep::new(pipe.clone());
        assert!(!sleeper.sleep(Duration::from_millis(10)));

        pipe.notify();
        let started = Instant::now();
        assert!(sleeper.sleep(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test_log::test]
    fn request_round_trip_skips_heartbeats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.sock");
        let server = serve_one(UnixListener::bind(&path).unwrap(), false, |mut payload, _| {
            payload.reverse();
            payload
        });

        let mut client = ClientConnection::new(config(&path));
        client.connect().unwrap();
        assert!(client.is_connected());
        client.send_heartbeat().unwrap();

        assert_eq!(client.request(b"abc", None).unwrap(), b"cba");
        assert_eq!(client.request(b"xy", None).unwrap(), b"yx");

        let stats = client.stats();
        assert_eq!(stats.requests_sent, 2);
        assert_eq!(stats.state, ClientState::Connected);
        assert_eq!(stats.socket_path, path);

        client.disconnect();
        assert_eq!(client.state(), ClientState::Closed);
        server.join().unwrap();
    }

    #[test]
    fn descriptor_follows_the_request_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fd.sock");
        let server = serve_one(UnixListener::bind(&path).unwrap(), true, |_, file| {
            let mut file = file.unwrap();
            let mut contents = Vec::new();
            file.seek(SeekFrom::Start(0)).unwrap();
            file.read_to_end(&mut contents).unwrap();
            contents
        });

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"shared through the socket").unwrap();

        let mut client = ClientConnection::new(config(&path));
        client.connect().unwrap();
        let reply = client.request(b"read this", Some(file.as_fd())).unwrap();
        assert_eq!(reply, b"shared through the socket");

        drop(client);
        server.join().unwrap();
    }

    #[test]
    fn silent_server_times_out_and_closes_the_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silent.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let mut client = ClientConnection::new(config(&path).with_timeout(Duration::from_millis(50)));
        client.connect().unwrap();
        let (_accepted, _) = listener.accept().unwrap();

        assert!(matches!(client.request(b"hello?", None), Err(IpcError::Timeout(_))));
        assert_eq!(client.state(), ClientState::Closed);
        assert!(matches!(client.request(b"again", None), Err(IpcError::NotConnected)));
    }
}
