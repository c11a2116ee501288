//! End-to-end porter handoff over a real Unix socket and loopback TCP.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use streamgate_core::config::PorterConfig;
use streamgate_porter::{Porter, PorterClient};

fn porter_config(socket_path: &std::path::Path) -> PorterConfig {
    PorterConfig {
        bind: "127.0.0.1:0".to_string(),
        socket_path: Some(socket_path.to_string_lossy().into_owned()),
        username: Some("porter-user".to_string()),
        password: Some("porter-pass".to_string()),
        ..PorterConfig::default()
    }
}

// S4: the backend receives the client socket with the rewritten first
// line, and the socket stays connected end to end.
#[tokio::test]
async fn test_handoff_delivers_socket_and_buffer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("porter.sock");
    let porter = Porter::bind(&porter_config(&socket_path))
        .await
        .expect("porter binds");
    let public_addr = porter.local_addr().expect("addr");
    tokio::spawn(porter.run());

    let mut backend = PorterClient::connect(
        &socket_path,
        "avatar-a",
        Some("porter-user"),
        Some("porter-pass"),
    )
    .await
    .expect("backend logs in");
    backend
        .register_prefix("/live/")
        .await
        .expect("prefix registered");
    assert_eq!(
        backend.get_port().await.expect("port"),
        public_addr.port()
    );

    let (tx, mut rx) = mpsc::channel(4);
    tokio::spawn(backend.run(tx));

    let mut client = TcpStream::connect(public_addr).await.expect("client connects");
    client
        .write_all(b"GET /live/show/stream.m3u8 HTTP/1.1\r\n")
        .await
        .expect("first line");

    let mut incoming = rx.recv().await.expect("handoff arrives");

    // The buffered bytes are the rewritten first line with the
    // injected request id.
    let buffered = String::from_utf8(incoming.buffered.clone()).expect("utf-8");
    assert!(buffered.starts_with("GET /live/show/stream.m3u8?FLUREQID="));
    assert!(buffered.ends_with(" HTTP/1.1\r\n"));
    let request_id = incoming.request_id.clone().expect("request id");
    assert_eq!(request_id.len(), 64);
    assert!(buffered.contains(&format!("FLUREQID={request_id}")));

    // The TCP connection survived the handoff: bytes written by the
    // client after the first line arrive on the re-materialized
    // socket, and backend writes reach the client.
    client.write_all(b"Host: example\r\n").await.expect("headers");
    let mut buf = [0u8; 15];
    incoming.stream.read_exact(&mut buf).await.expect("read");
    assert_eq!(&buf, b"Host: example\r\n");

    incoming
        .stream
        .write_all(b"HTTP/1.1 200 OK\r\n")
        .await
        .expect("respond");
    let mut buf = [0u8; 17];
    client.read_exact(&mut buf).await.expect("client reads");
    assert_eq!(&buf, b"HTTP/1.1 200 OK\r\n");
}

#[tokio::test]
async fn test_unrouted_path_gets_404() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("porter.sock");
    let porter = Porter::bind(&porter_config(&socket_path))
        .await
        .expect("porter binds");
    let public_addr = porter.local_addr().expect("addr");
    tokio::spawn(porter.run());

    let mut client = TcpStream::connect(public_addr).await.expect("client connects");
    client
        .write_all(b"GET /nowhere HTTP/1.1\r\n")
        .await
        .expect("first line");

    let mut response = String::new();
    client
        .read_to_string(&mut response)
        .await
        .expect("response");
    assert!(response.starts_with("HTTP/1.0 404 Not Found"));
}

#[tokio::test]
async fn test_bad_credentials_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("porter.sock");
    let porter = Porter::bind(&porter_config(&socket_path))
        .await
        .expect("porter binds");
    tokio::spawn(porter.run());

    let result = PorterClient::connect(
        &socket_path,
        "avatar-a",
        Some("porter-user"),
        Some("wrong"),
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_malformed_first_line_closes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("porter.sock");
    let porter = Porter::bind(&porter_config(&socket_path))
        .await
        .expect("porter binds");
    let public_addr = porter.local_addr().expect("addr");
    tokio::spawn(porter.run());

    let mut client = TcpStream::connect(public_addr).await.expect("client connects");
    client
        .write_all(b"NOT A VALID LINE\r\n")
        .await
        .expect("write");

    // Connection closes without a response.
    let mut out = Vec::new();
    client.read_to_end(&mut out).await.expect("read");
    assert!(out.is_empty());
}

#[tokio::test]
async fn test_departing_backend_unroutes_its_prefix() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("porter.sock");
    let porter = Porter::bind(&porter_config(&socket_path))
        .await
        .expect("porter binds");
    let public_addr = porter.local_addr().expect("addr");
    tokio::spawn(porter.run());

    let mut backend = PorterClient::connect(
        &socket_path,
        "avatar-a",
        Some("porter-user"),
        Some("porter-pass"),
    )
    .await
    .expect("backend logs in");
    backend
        .register_prefix("/live/")
        .await
        .expect("prefix registered");
    drop(backend);

    // The avatar detaches asynchronously; poll until routing reflects
    // the logout.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let mut client = TcpStream::connect(public_addr).await.expect("connect");
        client
            .write_all(b"GET /live/x HTTP/1.1\r\n")
            .await
            .expect("write");
        let mut response = String::new();
        client.read_to_string(&mut response).await.expect("read");
        if response.starts_with("HTTP/1.0 404") {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "prefix never deregistered, last response: {response:?}"
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
