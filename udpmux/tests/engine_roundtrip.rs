//! End-to-end tests for the socket multiplex engine over loopback.
//!
//! Each test that needs a fixed port uses its own, so the tests can run in
//! parallel within this binary.
//!
//! # Running with tracing
//!
//! ```bash
//! cargo test --features tracing --test engine_roundtrip -- --nocapture
//! RUST_LOG=udpmux=debug cargo test --features tracing --test engine_roundtrip -- --nocapture
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use udpmux::Outcome;
use udpmux::engine::{
    DatagramQueue, EngineConfig, EngineError, Role, SocketId, SocketMultiplexEngine, StatsSnapshot,
    UdpUser,
};
use udpmux::net::{Datagram, Endpoint};
use udpmux::pipe::{PipeEnd, UdpPipe};
use udpmux::sync::Timeout;

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        udpmux::init_tracing();
    });
}

/// Test user remembering what the engine told it.
#[derive(Default)]
struct Peer {
    socket: Mutex<Option<SocketId>>,
    queues: Mutex<Option<(Arc<DatagramQueue>, Arc<DatagramQueue>)>>,
    set_ups: AtomicUsize,
    invalidations: AtomicUsize,
}

impl Peer {
    fn input(&self) -> Arc<DatagramQueue> {
        Arc::clone(&self.queues.lock().unwrap().as_ref().expect("not set up").0)
    }

    fn output(&self) -> Arc<DatagramQueue> {
        Arc::clone(&self.queues.lock().unwrap().as_ref().expect("not set up").1)
    }

    fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

impl UdpUser for Peer {
    fn set_up(&self, socket: SocketId, input: Arc<DatagramQueue>, output: Arc<DatagramQueue>) {
        *self.socket.lock().unwrap() = Some(socket);
        *self.queues.lock().unwrap() = Some((input, output));
        self.set_ups.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_invalid(&self) {
        self.socket.lock().unwrap().take();
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        poll_timeout: Duration::from_millis(100),
        ..EngineConfig::default()
    }
}

fn started_engine(config: EngineConfig) -> SocketMultiplexEngine {
    let engine = SocketMultiplexEngine::new(config).expect("engine");
    assert_eq!(engine.start_up(Timeout::Infinite).unwrap(), Outcome::Done);
    engine
}

fn within(ms: u64) -> Timeout {
    Timeout::Duration(Duration::from_millis(ms))
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn attach_detach_semantics() {
    init_test_tracing();
    let engine = started_engine(test_config());
    let mut rng = rand::rng();

    let users: Vec<(Arc<Peer>, Role)> = (0..4)
        .map(|_| {
            let role = if rng.random_bool(0.5) {
                Role::Server
            } else {
                Role::Client
            };
            (Arc::new(Peer::default()), role)
        })
        .collect();
    // Servers take OS-assigned ports, clients aim at the discard port.
    let address = |role: Role| match role {
        Role::Server => Endpoint::localhost(0),
        Role::Client => Endpoint::localhost(9),
    };

    for (user, _) in &users {
        assert!(matches!(
            engine.detach_socket(&**user),
            Err(EngineError::NotAttached)
        ));
    }

    for (i, (user, role)) in users.iter().enumerate() {
        assert_eq!(
            engine
                .attach_socket(user.clone(), *role, address(*role))
                .unwrap(),
            Outcome::Done
        );
        assert_eq!(engine.attached_count(), i + 1);
        assert_eq!(user.set_ups.load(Ordering::SeqCst), 1);
        assert!(user.socket.lock().unwrap().is_some());
    }

    for (user, role) in &users {
        assert_eq!(
            engine
                .attach_socket(user.clone(), *role, address(*role))
                .unwrap(),
            Outcome::Already
        );
        assert_eq!(user.set_ups.load(Ordering::SeqCst), 1);
    }
    assert_eq!(engine.attached_count(), users.len());

    for (i, (user, _)) in users.iter().enumerate() {
        assert_eq!(engine.detach_socket(&**user).unwrap(), Outcome::Done);
        assert_eq!(user.invalidations(), 1);
        assert_eq!(engine.attached_count(), users.len() - i - 1);
    }

    // Attach, detach, attach again with the same identity.
    let (user, role) = &users[0];
    for round in 1..=2 {
        assert_eq!(
            engine
                .attach_socket(user.clone(), *role, address(*role))
                .unwrap(),
            Outcome::Done
        );
        assert_eq!(engine.detach_socket(&**user).unwrap(), Outcome::Done);
        assert_eq!(user.invalidations(), 1 + round);
    }

    assert_eq!(engine.tear_down(Timeout::Infinite).unwrap(), Outcome::Done);
}

#[test]
fn client_datagram_reaches_server() {
    init_test_tracing();
    let engine = started_engine(test_config());
    let server = Arc::new(Peer::default());
    let client = Arc::new(Peer::default());

    engine
        .attach_socket(server.clone(), Role::Server, Endpoint::localhost(5051))
        .unwrap();
    engine
        .attach_socket(client.clone(), Role::Client, Endpoint::localhost(5051))
        .unwrap();

    let payload = *b"12345678";
    client
        .output()
        .push(Datagram::from_bytes(&payload[..]))
        .unwrap();

    let received = server
        .input()
        .pop_blocking(within(500))
        .expect("no datagram within 500ms");
    assert_eq!(received.bytes(), payload);
    assert!(received.endpoint().is_some());

    thread::sleep(Duration::from_millis(50));
    assert!(server.input().pop().is_none(), "unexpected second datagram");

    let stats = engine.stats();
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.received, 1);
}

#[test]
fn server_replies_to_source() {
    init_test_tracing();
    let engine = started_engine(test_config());
    let server = Arc::new(Peer::default());
    let client = Arc::new(Peer::default());

    engine
        .attach_socket(server.clone(), Role::Server, Endpoint::localhost(5052))
        .unwrap();
    engine
        .attach_socket(client.clone(), Role::Client, Endpoint::localhost(5052))
        .unwrap();

    client
        .output()
        .push(Datagram::from_bytes(&b"request!"[..]))
        .unwrap();
    let request = server
        .input()
        .pop_blocking(within(500))
        .expect("no request within 500ms");

    let answer = Datagram::from_bytes(&b"answer!!"[..]);
    let source = request.endpoint().expect("received datagram has a source");
    server.output().push(answer.readdressed(source)).unwrap();

    let reply = client
        .input()
        .pop_blocking(within(500))
        .expect("no reply within 500ms");
    assert_eq!(reply.bytes(), b"answer!!");
    assert_eq!(reply.endpoint(), Some(Endpoint::localhost(5052)));
}

#[test]
fn sockets_survive_restart() {
    init_test_tracing();
    let engine = started_engine(test_config());
    let server = Arc::new(Peer::default());
    let client = Arc::new(Peer::default());

    engine
        .attach_socket(server.clone(), Role::Server, Endpoint::localhost(5054))
        .unwrap();
    engine
        .attach_socket(client.clone(), Role::Client, Endpoint::localhost(5054))
        .unwrap();

    assert_eq!(engine.tear_down(Timeout::Infinite).unwrap(), Outcome::Done);
    assert_eq!(engine.tear_down(Timeout::Infinite).unwrap(), Outcome::Already);
    assert!(!engine.is_running());

    // Queued while stopped, sent once the worker is back.
    client
        .output()
        .push(Datagram::from_bytes(&b"restart!"[..]))
        .unwrap();
    thread::sleep(Duration::from_millis(20));
    assert!(server.input().is_empty());

    assert_eq!(engine.start_up(Timeout::Infinite).unwrap(), Outcome::Done);
    assert_eq!(engine.start_up(Timeout::Infinite).unwrap(), Outcome::Already);
    let received = server
        .input()
        .pop_blocking(within(500))
        .expect("no datagram after restart");
    assert_eq!(received.bytes(), b"restart!");
}

#[test]
fn idle_engine_stays_responsive() {
    init_test_tracing();
    let engine = started_engine(test_config());

    thread::sleep(Duration::from_millis(50));
    assert!(engine.is_running());
    assert_eq!(engine.attached_count(), 0);

    let start = Instant::now();
    assert_eq!(engine.tear_down(within(1_000)).unwrap(), Outcome::Done);
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(engine.stats(), StatsSnapshot::default());
}

#[test]
fn descriptor_limit_evicts_attached_users() {
    init_test_tracing();
    let engine = started_engine(EngineConfig {
        descriptor_limit: 0,
        ..test_config()
    });
    let user = Arc::new(Peer::default());

    engine
        .attach_socket(user.clone(), Role::Server, Endpoint::localhost(0))
        .unwrap();

    wait_until("eviction", || user.invalidations() == 1);
    assert_eq!(engine.attached_count(), 0);
    assert_eq!(engine.stats().evicted, 1);
    assert!(matches!(
        engine.detach_socket(&*user),
        Err(EngineError::NotAttached)
    ));
}

#[test]
fn full_input_queue_drops_datagrams() {
    init_test_tracing();
    let engine = started_engine(EngineConfig {
        queue_capacity: 2,
        ..test_config()
    });
    let server = Arc::new(Peer::default());
    let client = Arc::new(Peer::default());

    engine
        .attach_socket(server.clone(), Role::Server, Endpoint::localhost(5055))
        .unwrap();
    engine
        .attach_socket(client.clone(), Role::Client, Endpoint::localhost(5055))
        .unwrap();

    let output = client.output();
    for i in 0..4u8 {
        output
            .push_blocking(Datagram::from_bytes(vec![i; 8]), within(500))
            .unwrap();
    }

    wait_until("all datagrams processed", || {
        let stats = engine.stats();
        stats.received + stats.receive_failed >= 4
    });

    let stats = engine.stats();
    assert_eq!(stats.input_dropped, 2);
    assert_eq!(server.input().len(), 2);
    // The first two made it, in order.
    assert_eq!(server.input().pop().unwrap().bytes(), [0u8; 8]);
    assert_eq!(server.input().pop().unwrap().bytes(), [1u8; 8]);
}

#[test]
fn dropping_engine_invalidates_users() {
    init_test_tracing();
    let user = Arc::new(Peer::default());
    {
        let engine = started_engine(test_config());
        engine
            .attach_socket(user.clone(), Role::Client, Endpoint::localhost(9))
            .unwrap();
    }
    assert_eq!(user.invalidations(), 1);
    assert!(user.socket.lock().unwrap().is_none());
}

#[test]
fn pipe_round_trip() {
    init_test_tracing();
    let engine = started_engine(test_config());

    let reader = UdpPipe::open(&engine, PipeEnd::Read, "127.0.0.1", 5053).unwrap();
    let writer = UdpPipe::open(&engine, PipeEnd::Write, "127.0.0.1", 5053).unwrap();

    writer
        .write_datagram(Datagram::from_bytes(&b"ping"[..]), Timeout::Infinite)
        .unwrap();
    let ping = reader.read_datagram(within(500)).unwrap();
    assert_eq!(ping.bytes(), b"ping");

    // Written back on the read end, a datagram returns to its sender.
    reader
        .write_datagram(Datagram::new(ping.endpoint().unwrap(), &b"pong"[..]), Timeout::Infinite)
        .unwrap();
    let pong = writer.read_datagram(within(500)).unwrap();
    assert_eq!(pong.bytes(), b"pong");

    drop(writer);
    assert_eq!(engine.attached_count(), 1);
    assert_eq!(reader.close().unwrap(), Outcome::Done);
    assert_eq!(engine.attached_count(), 0);
}
