#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use chatd::{ChatState, Server, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(3);

/// A running server on 127.0.0.1 with an OS-assigned port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: ChatState,
    pub stop: CancellationToken,
    pub handle: tokio::task::JoinHandle<()>,
}

/// Start a test server with the default loopback config.
pub async fn start_test_server() -> TestServer {
    start_test_server_with(ServerConfig::loopback()).await
}

/// Start a test server with a custom config. The port and addresses are
/// forced to loopback so tests never collide.
pub async fn start_test_server_with(config: ServerConfig) -> TestServer {
    let loopback = ServerConfig::loopback();
    let config = ServerConfig {
        port: loopback.port,
        ipv4: loopback.ipv4,
        ipv6: loopback.ipv6,
        ..config
    };
    let server = Server::bind(config).expect("test server should bind");
    let addr = server.local_addrs()[0];
    let state = server.state().clone();
    let stop = CancellationToken::new();
    let handle = tokio::spawn(server.run(stop.clone()));
    TestServer {
        addr,
        state,
        stop,
        handle,
    }
}

/// Connect and send `name`, without waiting for the outcome.
pub async fn connect_raw(addr: SocketAddr, name: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(name.as_bytes()).await.unwrap();
    stream
}

/// Connect, register `name`, and wait until the server has it on the roster.
/// A trailing newline in `name` is sent but not part of the registered name.
pub async fn join(server: &TestServer, name: &str) -> TcpStream {
    let stream = connect_raw(server.addr, name).await;
    let registered = name.trim_end();
    wait_until(|| server.state.registry.find_by_name(registered).is_some()).await;
    stream
}

/// Drop `stream` abortively: with `SO_LINGER` at zero the close sends a
/// reset instead of a FIN, so the server's next read fails.
#[allow(deprecated)]
pub fn reset(stream: TcpStream) {
    stream
        .set_linger(Some(Duration::ZERO))
        .expect("SO_LINGER should be settable");
    drop(stream);
}

/// Poll `cond` every 10ms until it holds, panicking after [`WAIT`].
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {WAIT:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Read exactly `expected.len()` bytes and compare.
pub async fn expect_text(stream: &mut TcpStream, expected: &str) {
    let mut buf = vec![0u8; expected.len()];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {expected:?}"))
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&buf), expected);
}

/// Assert the server closes the connection with no further data.
pub async fn expect_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 256];
    let result = tokio::time::timeout(WAIT, stream.read(&mut buf))
        .await
        .expect("timed out waiting for the server to close the connection");
    match result {
        Ok(0) => {}
        Ok(n) => panic!(
            "expected close, got data: {:?}",
            String::from_utf8_lossy(&buf[..n])
        ),
        // A reset is also a close
        Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
    }
}

/// Assert nothing arrives for a short while.
pub async fn expect_silence(stream: &mut TcpStream) {
    let mut buf = [0u8; 256];
    match tokio::time::timeout(Duration::from_millis(150), stream.read(&mut buf)).await {
        Err(_) => {}
        Ok(Ok(n)) => panic!(
            "expected silence, got {n} bytes: {:?}",
            String::from_utf8_lossy(&buf[..n])
        ),
        Ok(Err(e)) => panic!("expected silence, got error: {e}"),
    }
}
