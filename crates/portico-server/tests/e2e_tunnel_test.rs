//! End-to-end tunnel tests
//!
//! Runs a real server, real clients, and real origins on ephemeral local
//! ports, then drives the public surface with plain TCP callers.

use portico_client::{ClientConfig, ClientError, ReconnectConfig};
use portico_proto::{Frame, Protocol};
use portico_server::{Server, ServerConfig};
use portico_transport::ControlChannel;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

async fn spawn_server(request_timeout: Duration) -> SocketAddr {
    let config = ServerConfig {
        control_port: 0,
        host: "localhost".to_string(),
        request_timeout,
        max_pending: 64,
    };
    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

fn client_config(control_addr: SocketAddr, local_port: u16, public_port: u16, protocol: Protocol) -> ClientConfig {
    ClientConfig {
        local_port,
        public_port,
        protocol,
        server_host: control_addr.ip().to_string(),
        control_port: control_addr.port(),
        reconnect: ReconnectConfig {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(50),
            multiplier: 1.0,
            max_attempts: Some(3),
        },
    }
}

/// Reserve a port by binding and immediately releasing it.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_port(addr: SocketAddr) {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("port {} never became reachable", addr);
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read one HTTP/1.1 request off a socket: (request line, body).
async fn read_http_request(socket: &mut TcpStream) -> Option<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut tmp).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let request_line = head.lines().next().unwrap_or("").to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut tmp).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&tmp[..n]);
    }
    Some((request_line, body))
}

/// HTTP origin answering every request with 200 and a fixed body,
/// recording the request lines it sees.
async fn spawn_fixed_origin(body: &'static str) -> (u16, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let seen_accept = seen.clone();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            let seen = seen_accept.clone();
            tokio::spawn(async move {
                while let Some((request_line, _)) = read_http_request(&mut socket).await {
                    seen.lock().unwrap().push(request_line);
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    if socket.write_all(response.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (port, seen)
}

/// HTTP origin that echoes each request body back.
async fn spawn_echo_origin() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                while let Some((_, body)) = read_http_request(&mut socket).await {
                    let head = format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n",
                        body.len()
                    );
                    if socket.write_all(head.as_bytes()).await.is_err()
                        || socket.write_all(&body).await.is_err()
                    {
                        break;
                    }
                }
            });
        }
    });
    port
}

/// Origin that accepts connections and never replies.
async fn spawn_silent_origin() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut sink = vec![0u8; 1024];
                while matches!(socket.read(&mut sink).await, Ok(n) if n > 0) {}
            });
        }
    });
    port
}

/// TCP echo origin.
async fn spawn_tcp_echo_origin() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let (mut read_half, mut write_half) = socket.split();
                let _ = tokio::io::copy(&mut read_half, &mut write_half).await;
            });
        }
    });
    port
}

/// Issue one raw HTTP request and collect the full response.
async fn public_http_request(addr: SocketAddr, raw: String) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf).to_string()
}

#[tokio::test]
async fn test_simple_http_get() {
    let control_addr = spawn_server(Duration::from_secs(5)).await;
    let (origin_port, seen) = spawn_fixed_origin("hi").await;
    let public_port = free_port().await;

    let config = client_config(control_addr, origin_port, public_port, Protocol::Http);
    tokio::spawn(portico_client::run(config));

    let public_addr: SocketAddr = format!("127.0.0.1:{}", public_port).parse().unwrap();
    wait_for_port(public_addr).await;

    let response = timeout(
        Duration::from_secs(5),
        public_http_request(
            public_addr,
            format!("GET /a?b=1 HTTP/1.1\r\nHost: localhost:{}\r\nConnection: close\r\n\r\n", public_port),
        ),
    )
    .await
    .unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "response: {}", response);
    assert!(response.ends_with("hi"), "response: {}", response);

    // The origin saw the path and query untouched.
    let seen = seen.lock().unwrap();
    assert!(seen.iter().any(|line| line.starts_with("GET /a?b=1 ")), "origin saw: {:?}", seen);
}

#[tokio::test]
async fn test_port_collision_rejects_second_client() {
    let control_addr = spawn_server(Duration::from_secs(5)).await;
    let (origin_port, _) = spawn_fixed_origin("hi").await;
    let public_port = free_port().await;

    let config_a = client_config(control_addr, origin_port, public_port, Protocol::Http);
    tokio::spawn(portico_client::run(config_a));

    let public_addr: SocketAddr = format!("127.0.0.1:{}", public_port).parse().unwrap();
    wait_for_port(public_addr).await;

    // Second client wants the same public port.
    let config_b = client_config(control_addr, origin_port, public_port, Protocol::Http);
    let result = timeout(Duration::from_secs(5), portico_client::run(config_b))
        .await
        .unwrap();

    match result {
        Err(ClientError::Rejected(message)) => {
            assert!(message.contains(&public_port.to_string()), "message: {}", message);
        }
        other => panic!("expected rejection, got {:?}", other.err()),
    }

    // The first tunnel is unaffected.
    let response = public_http_request(
        public_addr,
        "GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n".to_string(),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"));
}

#[tokio::test]
async fn test_silent_origin_returns_504() {
    let control_addr = spawn_server(Duration::from_millis(300)).await;
    let origin_port = spawn_silent_origin().await;
    let public_port = free_port().await;

    let config = client_config(control_addr, origin_port, public_port, Protocol::Http);
    tokio::spawn(portico_client::run(config));

    let public_addr: SocketAddr = format!("127.0.0.1:{}", public_port).parse().unwrap();
    wait_for_port(public_addr).await;

    let response = timeout(
        Duration::from_secs(5),
        public_http_request(
            public_addr,
            "GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n".to_string(),
        ),
    )
    .await
    .unwrap();

    assert!(response.starts_with("HTTP/1.1 504"), "response: {}", response);
}

#[tokio::test]
async fn test_disconnect_mid_flight_returns_502_and_frees_port() {
    let control_addr = spawn_server(Duration::from_secs(30)).await;
    let public_port = free_port().await;

    // Drive the control channel by hand so we can kill it mid-request.
    let channel = ControlChannel::connect(control_addr).await.unwrap();
    let (tx, mut rx) = channel.split();
    tx.send(Frame::Register {
        local_port: 1,
        public_port,
        protocol: Protocol::Http,
    })
    .await
    .unwrap();
    assert!(matches!(rx.recv().await, Some(Frame::Registered { .. })));

    let public_addr: SocketAddr = format!("127.0.0.1:{}", public_port).parse().unwrap();
    wait_for_port(public_addr).await;

    let request = tokio::spawn(public_http_request(
        public_addr,
        "POST /upload HTTP/1.1\r\nHost: x\r\nConnection: close\r\ncontent-length: 4\r\n\r\nabcd".to_string(),
    ));

    // Wait until the request is in flight on the control channel, then die.
    match timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
        Some(Frame::HttpRequest { body, .. }) => assert_eq!(body, Some(b"abcd".to_vec())),
        other => panic!("expected HttpRequest, got {:?}", other),
    }
    tx.close();
    drop(rx);

    let response = timeout(Duration::from_secs(5), request).await.unwrap().unwrap();
    assert!(response.starts_with("HTTP/1.1 502"), "response: {}", response);

    // The public port is released for a fresh registration.
    let channel = ControlChannel::connect(control_addr).await.unwrap();
    let (tx2, mut rx2) = channel.split();
    for _ in 0..50 {
        tx2.send(Frame::Register {
            local_port: 1,
            public_port,
            protocol: Protocol::Http,
        })
        .await
        .unwrap();
        match timeout(Duration::from_secs(5), rx2.recv()).await.unwrap() {
            Some(Frame::Registered { .. }) => return,
            Some(Frame::Error { .. }) => sleep(Duration::from_millis(50)).await,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
    panic!("public port {} was never released", public_port);
}

#[tokio::test]
async fn test_rejected_register_leaves_session_usable() {
    let control_addr = spawn_server(Duration::from_secs(5)).await;
    let (origin_port, _) = spawn_fixed_origin("hi").await;
    let occupied_port = free_port().await;

    let config = client_config(control_addr, origin_port, occupied_port, Protocol::Http);
    tokio::spawn(portico_client::run(config));
    let public_addr: SocketAddr = format!("127.0.0.1:{}", occupied_port).parse().unwrap();
    wait_for_port(public_addr).await;

    // Same session: first attempt collides, second succeeds on a new port.
    let channel = ControlChannel::connect(control_addr).await.unwrap();
    let (tx, mut rx) = channel.split();

    tx.send(Frame::Register {
        local_port: 1,
        public_port: occupied_port,
        protocol: Protocol::Http,
    })
    .await
    .unwrap();
    match timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
        Some(Frame::Error { message }) => assert!(message.contains(&occupied_port.to_string())),
        other => panic!("expected Error, got {:?}", other),
    }

    let retry_port = free_port().await;
    tx.send(Frame::Register {
        local_port: 1,
        public_port: retry_port,
        protocol: Protocol::Http,
    })
    .await
    .unwrap();
    match timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
        Some(Frame::Registered { public_port, .. }) => assert_eq!(public_port, retry_port),
        other => panic!("expected Registered, got {:?}", other),
    }
}

#[tokio::test]
async fn test_tcp_echo() {
    let control_addr = spawn_server(Duration::from_secs(5)).await;
    let origin_port = spawn_tcp_echo_origin().await;
    let public_port = free_port().await;

    let config = client_config(control_addr, origin_port, public_port, Protocol::Tcp);
    tokio::spawn(portico_client::run(config));

    let public_addr: SocketAddr = format!("127.0.0.1:{}", public_port).parse().unwrap();
    wait_for_port(public_addr).await;

    let mut stream = TcpStream::connect(public_addr).await.unwrap();
    stream.write_all(b"ping").await.unwrap();

    let mut reply = [0u8; 4];
    timeout(Duration::from_secs(5), stream.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"ping");

    // A second round trip on the same connection reuses the same origin
    // connection on the client side.
    stream.write_all(b"pong").await.unwrap();
    timeout(Duration::from_secs(5), stream.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"pong");
}

#[tokio::test]
async fn test_concurrent_requests_preserve_bodies() {
    let control_addr = spawn_server(Duration::from_secs(10)).await;
    let origin_port = spawn_echo_origin().await;
    let public_port = free_port().await;

    let config = client_config(control_addr, origin_port, public_port, Protocol::Http);
    tokio::spawn(portico_client::run(config));

    let public_addr: SocketAddr = format!("127.0.0.1:{}", public_port).parse().unwrap();
    wait_for_port(public_addr).await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let body = format!("payload-{}-{}", i, "x".repeat(64 * i));
        let raw = format!(
            "POST /echo HTTP/1.1\r\nHost: x\r\nConnection: close\r\ncontent-length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        handles.push(tokio::spawn(async move {
            let response = public_http_request(public_addr, raw).await;
            (body, response)
        }));
    }

    for handle in handles {
        let (body, response) = timeout(Duration::from_secs(10), handle).await.unwrap().unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "response: {}", response);
        assert!(response.ends_with(&body), "body {} not echoed: {}", body, response);
    }
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_requests() {
    let config = ServerConfig {
        control_port: 0,
        host: "localhost".to_string(),
        request_timeout: Duration::from_secs(30),
        max_pending: 64,
    };
    let server = Server::bind(config).await.unwrap();
    let control_addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    let server_task = tokio::spawn(server.run());

    let public_port = free_port().await;
    let channel = ControlChannel::connect(control_addr).await.unwrap();
    let (tx, mut rx) = channel.split();
    tx.send(Frame::Register {
        local_port: 1,
        public_port,
        protocol: Protocol::Http,
    })
    .await
    .unwrap();
    assert!(matches!(rx.recv().await, Some(Frame::Registered { .. })));

    let public_addr: SocketAddr = format!("127.0.0.1:{}", public_port).parse().unwrap();
    wait_for_port(public_addr).await;

    // Park a public request on the pending table, then shut down.
    let request = tokio::spawn(public_http_request(
        public_addr,
        "GET /slow HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n".to_string(),
    ));
    match timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
        Some(Frame::HttpRequest { .. }) => {}
        other => panic!("expected HttpRequest, got {:?}", other),
    }

    shutdown.shutdown();

    // The parked caller is drained with a gateway error, not left hanging.
    let response = timeout(Duration::from_secs(5), request).await.unwrap().unwrap();
    assert!(response.starts_with("HTTP/1.1 502"), "response: {}", response);

    // run() returns once every session has finished its teardown.
    timeout(Duration::from_secs(5), server_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
