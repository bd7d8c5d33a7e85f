use std::{
    fs,
    io::Write,
    os::{fd::AsFd, unix::net::{UnixListener, UnixStream}},
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use warden_common::{
    AgentMessage, BincodeCodec, FrameLength, FramedStream, IpcError, PayloadCodec, Result,
};
use warden_server::{
    AgentHandlerFactory, HandlerFactory, HandlerReply, PeerInfo, PeerPolicy, Request,
    RequestHandler, ServerConfig, ServerHooks, ServerSocket, ServerState, StopHandle,
};

#[derive(Default)]
struct RecordingHooks {
    rejected: AtomicUsize,
    fatal:    Mutex<Vec<String>>,
}

impl ServerHooks for RecordingHooks {
    fn on_max_connections(&self, _limit: usize) {
        self.rejected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_fatal(&self, reason: &str) {
        self.fatal.lock().unwrap().push(reason.to_string());
    }
}

fn echo_factory() -> Arc<dyn HandlerFactory> {
    Arc::new(|_: &PeerInfo| -> Box<dyn RequestHandler> {
        Box::new(|request: Request| HandlerReply::success(request.payload))
    })
}

fn start(
    config: ServerConfig,
    factory: Arc<dyn HandlerFactory>,
    hooks: Arc<RecordingHooks>,
) -> (StopHandle, JoinHandle<Result<()>>) {
    let mut server = ServerSocket::bind(config, factory).unwrap().with_hooks(hooks);
    assert_eq!(server.state(), ServerState::Listening);
    let stop = server.stop_handle();
    let handle = thread::spawn(move || server.run());
    (stop, handle)
}

fn connect(path: &Path) -> FramedStream {
    FramedStream::new(UnixStream::connect(path).unwrap())
}

fn round_trip(client: &FramedStream, payload: &[u8]) -> Vec<u8> {
    client.write_frame(payload).unwrap();
    match client.read_length().unwrap() {
        FrameLength::Bytes(n) => client.read_payload(n, Duration::from_secs(2)).unwrap(),
        other => panic!("expected a response frame, got {other:?}"),
    }
}

fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test_log::test]
fn serves_requests_and_cleans_up_on_stop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("echo.sock");
    let (stop, handle) = start(
        ServerConfig::new().with_socket_path(&path),
        echo_factory(),
        Arc::default(),
    );

    let client = connect(&path);
    client.send_heartbeat().unwrap();
    assert_eq!(round_trip(&client, b"hello"), b"hello");
    assert_eq!(round_trip(&client, &[9u8; 4096]), vec![9u8; 4096]);

    stop.notify();
    handle.join().unwrap().unwrap();
    assert!(!path.exists());
    assert_eq!(client.read_length().unwrap(), FrameLength::Eof);
}

#[test]
fn stale_socket_entry_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stale.sock");
    drop(UnixListener::bind(&path).unwrap());
    assert!(path.exists());

    let (stop, handle) = start(
        ServerConfig::new().with_socket_path(&path),
        echo_factory(),
        Arc::default(),
    );
    assert_eq!(round_trip(&connect(&path), b"fresh"), b"fresh");

    stop.notify();
    handle.join().unwrap().unwrap();
}

#[test]
fn failed_bind_leaves_no_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("no-such-dir").join("server.sock");

    let err = ServerSocket::bind(ServerConfig::new().with_socket_path(&path), echo_factory())
        .err()
        .expect("bind into a missing directory must fail");
    assert!(matches!(err, IpcError::Bind { .. }));
    assert!(!path.exists());
}

#[test]
fn dropping_an_unrun_server_removes_its_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("unrun.sock");

    let server = ServerSocket::bind(ServerConfig::new().with_socket_path(&path), echo_factory())
        .unwrap();
    assert!(path.exists());
    drop(server);
    assert!(!path.exists());
}

#[test_log::test]
fn connections_over_the_limit_are_closed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("limited.sock");
    let hooks = Arc::new(RecordingHooks::default());
    let (stop, handle) = start(
        ServerConfig::new().with_socket_path(&path).with_max_connections(1),
        echo_factory(),
        hooks.clone(),
    );

    let first = connect(&path);
    assert_eq!(round_trip(&first, b"one"), b"one");

    let second = connect(&path);
    assert_eq!(second.read_length().unwrap(), FrameLength::Eof);
    wait_until(|| hooks.rejected.load(Ordering::SeqCst) == 1);

    // The first connection is unaffected.
    assert_eq!(round_trip(&first, b"still here"), b"still here");

    stop.notify();
    handle.join().unwrap().unwrap();
}

#[test_log::test]
fn stop_waits_for_the_request_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slow.sock");
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let factory: Arc<dyn HandlerFactory> = {
        let started = started.clone();
        let finished = finished.clone();
        Arc::new(move |_: &PeerInfo| -> Box<dyn RequestHandler> {
            let started = started.clone();
            let finished = finished.clone();
            Box::new(move |request: Request| {
                started.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(300));
                finished.store(true, Ordering::SeqCst);
                HandlerReply::success(request.payload)
            })
        })
    };
    let (stop, handle) = start(
        ServerConfig::new().with_socket_path(&path),
        factory,
        Arc::default(),
    );

    let client = connect(&path);
    client.write_frame(b"slow").unwrap();
    wait_until(|| started.load(Ordering::SeqCst));

    stop.notify();
    handle.join().unwrap().unwrap();
    assert!(finished.load(Ordering::SeqCst), "run() returned before the worker stopped");
    assert!(!path.exists());
}

#[test]
fn fatal_outcome_goes_to_the_hooks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fatal.sock");
    let hooks = Arc::new(RecordingHooks::default());
    let factory: Arc<dyn HandlerFactory> = Arc::new(|_: &PeerInfo| -> Box<dyn RequestHandler> {
        Box::new(|_: Request| HandlerReply::fatal("corrupt state"))
    });
    let (stop, handle) = start(
        ServerConfig::new().with_socket_path(&path),
        factory,
        hooks.clone(),
    );

    let client = connect(&path);
    client.write_frame(b"anything").unwrap();
    assert_eq!(client.read_length().unwrap(), FrameLength::Eof);
    wait_until(|| hooks.fatal.lock().unwrap().len() == 1);

    stop.notify();
    handle.join().unwrap().unwrap();
}

#[test]
fn short_payload_drops_only_that_connection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short.sock");
    let (stop, handle) = start(
        ServerConfig::new()
            .with_socket_path(&path)
            .with_read_timeout(Duration::from_millis(100)),
        echo_factory(),
        Arc::default(),
    );

    let broken = connect(&path);
    // Announce 100 bytes, deliver 3.
    (&*broken.get_ref()).write_all(&[100, 1, 2, 3]).unwrap();
    assert_eq!(broken.read_length().unwrap(), FrameLength::Eof);

    assert_eq!(round_trip(&connect(&path), b"ok"), b"ok");

    stop.notify();
    handle.join().unwrap().unwrap();
}

#[cfg(target_os = "linux")]
#[test]
fn peers_outside_the_uid_list_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policy.sock");
    let (stop, handle) = start(
        ServerConfig::new()
            .with_socket_path(&path)
            .with_peer_policy(PeerPolicy::AllowAll.allowing([u32::MAX - 1])),
        echo_factory(),
        Arc::default(),
    );

    let refused = connect(&path);
    assert_eq!(refused.read_length().unwrap(), FrameLength::Eof);

    stop.notify();
    handle.join().unwrap().unwrap();
}

#[test_log::test]
fn agent_protocol_hashes_a_passed_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.sock");
    let (stop, handle) = start(
        ServerConfig::new().with_socket_path(&path),
        Arc::new(AgentHandlerFactory),
        Arc::default(),
    );
    let codec = BincodeCodec::<AgentMessage>::new();
    let client = connect(&path);

    let pong = round_trip(&client, &codec.encode(&AgentMessage::Ping).unwrap());
    assert_eq!(codec.decode(&pong).unwrap(), AgentMessage::Pong);

    let file_path = dir.path().join("sample.txt");
    fs::write(&file_path, b"abc").unwrap();
    let file = fs::File::open(&file_path).unwrap();

    let request = AgentMessage::ScanRequest {
        id:   42,
        path: file_path.display().to_string(),
    };
    client.write_frame(&codec.encode(&request).unwrap()).unwrap();
    client.send_descriptor(file.as_fd()).unwrap();
    let FrameLength::Bytes(n) = client.read_length().unwrap() else {
        panic!("expected a verdict frame");
    };
    let verdict = codec.decode(&client.read_payload(n, Duration::from_secs(2)).unwrap()).unwrap();
    assert_eq!(
        verdict,
        AgentMessage::ScanVerdict {
            id:     42,
            size:   3,
            sha256: "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".into(),
        }
    );

    stop.notify();
    handle.join().unwrap().unwrap();
}

#[cfg(target_os = "linux")]
#[test_log::test]
fn endless_device_does_not_wedge_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zero.sock");
    let mut server = ServerSocket::bind(
        ServerConfig::new().with_socket_path(&path),
        Arc::new(AgentHandlerFactory),
    )
    .unwrap();
    let stop = server.stop_handle();
    let (done, finished) = mpsc::channel();
    thread::spawn(move || done.send(server.run()).unwrap());

    let codec = BincodeCodec::<AgentMessage>::new();
    let client = connect(&path);
    let request = AgentMessage::ScanRequest {
        id:   7,
        path: "/dev/zero".into(),
    };
    client.write_frame(&codec.encode(&request).unwrap()).unwrap();
    client.send_descriptor(fs::File::open("/dev/zero").unwrap().as_fd()).unwrap();

    let FrameLength::Bytes(n) = client.read_length().unwrap() else {
        panic!("expected an error frame");
    };
    let reply = codec.decode(&client.read_payload(n, Duration::from_secs(2)).unwrap()).unwrap();
    assert!(matches!(reply, AgentMessage::Error { id: 7, .. }), "{reply:?}");

    stop.notify();
    finished
        .recv_timeout(Duration::from_secs(5))
        .expect("run() returned after stop")
        .unwrap();
    assert!(!path.exists());
}
