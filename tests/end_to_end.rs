//! End-to-end tests over the software transport on loopback.

use bytes::Bytes;
use flashrpc::transport::Device;
use flashrpc::{
    Client, EchoHandler, PollMode, RequestHandler, RpcConfig, RpcError, Server, ServerStats,
    ShutdownHandle, SortHandler,
};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct TestServer {
    addr: SocketAddr,
    device: Arc<Device>,
    stats: Arc<ServerStats>,
    stop: ShutdownHandle,
    reactor: Option<JoinHandle<flashrpc::Result<()>>>,
}

impl TestServer {
    fn start(name: &str, handler: impl RequestHandler + 'static, config: RpcConfig) -> Self {
        let device = Device::open(name);
        let config = config.with_device(Arc::clone(&device));
        let server = Server::bind("127.0.0.1", 0, handler, config).unwrap();
        let addr = server.local_addr();
        let stats = server.stats();
        let stop = server.shutdown_handle();
        let reactor = thread::spawn(move || server.run());
        Self {
            addr,
            device,
            stats,
            stop,
            reactor: Some(reactor),
        }
    }

    fn client(&self, name: &str) -> (Client, Arc<Device>) {
        let device = Device::open(name);
        let mut client = Client::new(client_config(Arc::clone(&device))).unwrap();
        client.connect("127.0.0.1", self.addr.port()).unwrap();
        (client, device)
    }

    /// Waits until the server has torn down every connection.
    fn wait_idle(&self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        let idle = || self.stats.active() == 0 && self.device.resource_counts().is_empty();
        while !idle() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(self.stats.active(), 0, "server still holds connections");
        assert!(self.device.resource_counts().is_empty(), "server still holds resources");
    }

    fn stop(&mut self) {
        self.stop.shutdown();
        if let Some(reactor) = self.reactor.take() {
            reactor.join().unwrap().unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.shutdown();
        if let Some(reactor) = self.reactor.take() {
            let _ = reactor.join();
        }
    }
}

fn server_config() -> RpcConfig {
    RpcConfig::default()
        .with_buffer_pages(1)
        .with_poll_mode(PollMode::Backoff)
}

fn client_config(device: Arc<Device>) -> RpcConfig {
    RpcConfig::default()
        .with_device(device)
        .with_buffer_pages(1)
        .with_poll_mode(PollMode::Backoff)
}

#[test]
fn test_hello_is_sorted() {
    let server = TestServer::start(
        "e2e-hello-server",
        SortHandler,
        server_config().with_poll_mode(PollMode::Busy),
    );
    let (mut client, _device) = server.client("e2e-hello-client");

    let response = client.call(b"hello").unwrap();
    assert_eq!(response.payload(), b"ehllo");
    assert_eq!(response.data_len(), 5);

    client.disconnect().unwrap();
}

#[test]
fn test_round_trip_identity() {
    let server = TestServer::start("e2e-echo-server", EchoHandler, server_config());
    let (mut client, _device) = server.client("e2e-echo-client");

    for len in 0..=64usize {
        let payload: Vec<u8> = (0..len).map(|i| (i * 7 + len) as u8).collect();
        let response = client.call(&payload).unwrap();
        assert_eq!(response.payload(), &payload[..], "length {len}");
    }

    client.disconnect().unwrap();
    server.wait_idle();
    assert_eq!(server.stats.requests_served.load(Ordering::Relaxed), 65);
}

#[test]
fn test_at_most_one_outstanding_request() {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let handler = move |payload: &[u8]| {
        let _ = release_rx.lock().unwrap().recv();
        Bytes::copy_from_slice(payload)
    };

    let server = TestServer::start("e2e-gate-server", handler, server_config());
    let (mut client, _device) = server.client("e2e-gate-client");

    let first = client.send(b"first").unwrap();
    thread::scope(|scope| {
        let second = scope.spawn(|| client.send(b"second").unwrap());

        // The handler holds the first request, so the gate stays taken
        thread::sleep(Duration::from_millis(100));
        assert!(!second.is_finished());

        release_tx.send(()).unwrap();
        assert_eq!(client.wait_response(first).unwrap().payload(), b"first");

        let second = second.join().unwrap();
        release_tx.send(()).unwrap();
        assert_eq!(client.wait_response(second).unwrap().payload(), b"second");
    });

    client.disconnect().unwrap();
}

#[test]
fn test_connect_disconnect_cycles_release_everything() {
    let server = TestServer::start(
        "e2e-cycles-server",
        SortHandler,
        server_config().with_max_connections(64),
    );
    let client_device = Device::open("e2e-cycles-client");
    let mut client = Client::new(client_config(Arc::clone(&client_device))).unwrap();

    for cycle in 0..1000 {
        client.connect("127.0.0.1", server.addr.port()).unwrap();
        if cycle % 100 == 0 {
            assert_eq!(client.call(b"cba").unwrap().payload(), b"abc");
        }
        client.disconnect().unwrap();
        assert!(
            client_device.resource_counts().is_empty(),
            "client leaked in cycle {cycle}"
        );
    }

    server.wait_idle();
    assert!(server.device.resource_counts().is_empty());
    assert_eq!(
        server.stats.connections_accepted.load(Ordering::Relaxed),
        1000
    );
}

#[test]
fn test_concurrent_clients() {
    let server = TestServer::start(
        "e2e-concurrent-server",
        SortHandler,
        server_config().with_max_connections(16),
    );

    thread::scope(|scope| {
        for worker in 0..4 {
            let server = &server;
            scope.spawn(move || {
                for round in 0..5 {
                    let (mut client, device) = server.client(&format!("e2e-concurrent-{worker}"));
                    for _ in 0..20 {
                        let payload = flashrpc::random_payload(16);
                        let mut expected = payload.clone();
                        expected.sort_unstable();
                        let response = client.call(&payload).unwrap();
                        assert_eq!(response.payload(), &expected[..], "worker {worker} round {round}");
                    }
                    client.disconnect().unwrap();
                    assert!(device.resource_counts().is_empty());
                }
            });
        }
    });

    server.wait_idle();
    assert!(server.device.resource_counts().is_empty());
    assert_eq!(server.stats.connections_accepted.load(Ordering::Relaxed), 20);
    assert_eq!(server.stats.requests_served.load(Ordering::Relaxed), 400);
}

#[test]
fn test_server_at_capacity_rejects() {
    let server = TestServer::start(
        "e2e-capacity-server",
        SortHandler,
        server_config().with_max_connections(1),
    );
    let (mut first, _first_device) = server.client("e2e-capacity-first");

    let second_device = Device::open("e2e-capacity-second");
    let mut second = Client::new(client_config(Arc::clone(&second_device))).unwrap();
    let err = second.connect("127.0.0.1", server.addr.port()).unwrap_err();
    assert!(matches!(err, RpcError::UnexpectedEvent { .. }), "{err}");
    assert!(!second.is_connected());
    assert!(second_device.resource_counts().is_empty());
    assert_eq!(server.stats.connections_rejected.load(Ordering::Relaxed), 1);

    // The admitted client is unaffected
    assert_eq!(first.call(b"zyx").unwrap().payload(), b"xyz");
    first.disconnect().unwrap();
}

#[test]
fn test_handler_contract_violation_fails_connection() {
    let handler = |_: &[u8]| Bytes::from(vec![b'x'; 65]);
    let server = TestServer::start("e2e-contract-server", handler, server_config());
    let (mut client, device) = server.client("e2e-contract-client");

    assert!(matches!(
        client.call(b"boom"),
        Err(RpcError::ConnectionFailed(_))
    ));

    client.disconnect().unwrap();
    assert!(device.resource_counts().is_empty());
    server.wait_idle();
    assert!(server.device.resource_counts().is_empty());
}

#[test]
fn test_server_shutdown_fails_client_requests() {
    let mut server = TestServer::start("e2e-shutdown-server", SortHandler, server_config());
    let (mut client, device) = server.client("e2e-shutdown-client");
    assert_eq!(client.call(b"ba").unwrap().payload(), b"ab");

    server.stop();
    assert!(server.device.resource_counts().is_empty());

    // The link may take a moment to report the server gone
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut failed = false;
    while Instant::now() < deadline {
        match client.call(b"ba") {
            Err(RpcError::ConnectionFailed(_)) => {
                failed = true;
                break;
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => thread::sleep(Duration::from_millis(10)),
        }
    }
    assert!(failed);

    client.disconnect().unwrap();
    assert!(device.resource_counts().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_serve_until_signal() {
    let server_device = Device::open("e2e-serve-server");
    let server = Server::bind(
        "127.0.0.1",
        0,
        SortHandler,
        server_config().with_device(Arc::clone(&server_device)),
    )
    .unwrap();
    let port = server.local_addr().port();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let serving = tokio::spawn(server.serve_until(async {
        let _ = stop_rx.await;
    }));

    let response = tokio::task::spawn_blocking(move || {
        let mut client = Client::new(client_config(Device::open("e2e-serve-client")))?;
        client.connect("127.0.0.1", port)?;
        let response = client.call(b"tokio")?;
        client.disconnect()?;
        Ok::<_, RpcError>(response)
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(response.payload(), b"ikoot");

    stop_tx.send(()).unwrap();
    serving.await.unwrap().unwrap();
    assert!(server_device.resource_counts().is_empty());
}
