//! Common utilities for integration tests
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;
use throttled_proxy::{ProxyConfig, ProxyServer, TrafficSnapshot};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// A proxy running on an ephemeral local port
pub struct TestProxy {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<throttled_proxy::Result<TrafficSnapshot>>,
}

/// Proxy config bound to 127.0.0.1 on an ephemeral port
pub fn local_config() -> ProxyConfig {
    ProxyConfig {
        bind_addr: "127.0.0.1".to_string(),
        port: 0,
        ..Default::default()
    }
}

/// Start a proxy with the given config
pub async fn spawn_proxy(config: ProxyConfig) -> TestProxy {
    let shutdown = CancellationToken::new();
    let server = ProxyServer::bind(&config, shutdown.clone())
        .await
        .expect("Failed to bind proxy");
    let addr = server.local_addr().expect("Failed to get proxy addr");
    let handle = tokio::spawn(server.serve());

    TestProxy {
        addr,
        shutdown,
        handle,
    }
}

/// An address with no listener behind it
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to random port");
    listener.local_addr().expect("Failed to get local addr")
}

/// Create a simple echo server for testing
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) => break, // Connection closed
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }
    });

    addr
}

/// Server that reads everything it is sent and reports the byte count
/// of each connection once the client closes it
pub async fn start_sink_server() -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<usize>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind sink server");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut total = 0;
                let mut buf = vec![0u8; 8192];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    total += n;
                }
                let _ = tx.send(total);
            });
        }
    });

    (addr, rx)
}

/// Server that accepts one connection and hands it to the test
pub async fn start_single_accept_server() -> (SocketAddr, oneshot::Receiver<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind server");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        if let Ok((socket, _)) = listener.accept().await {
            let _ = tx.send(socket);
        }
    });

    (addr, rx)
}

/// Raw HTTP origin: captures the request head, then writes `response` verbatim
/// and closes the connection
pub async fn start_raw_origin(
    response: &'static [u8],
) -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind origin");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Ok(head) = read_head(&mut socket).await {
                    let _ = tx.send(head);
                    let _ = socket.write_all(response).await;
                    let _ = socket.shutdown().await;
                }
            });
        }
    });

    (addr, rx)
}

/// Read an HTTP message head byte by byte up to the blank line, leaving
/// anything after it unread on the socket
pub async fn read_head(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before end of head",
            ));
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Status code from the first line of a response head
pub fn status_of(head: &str) -> u16 {
    head.split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("Malformed status line")
}

/// Send CONNECT through the proxy; returns the socket and the response head
pub async fn connect_tunnel(proxy: SocketAddr, target: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy)
        .await
        .expect("Failed to connect to proxy");
    let request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n",
        target, target
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = timeout(Duration::from_secs(15), read_head(&mut stream))
        .await
        .expect("Timed out waiting for CONNECT response")
        .expect("Failed to read CONNECT response");
    (stream, head)
}

/// Read the rest of a stream, failing if it does not close within `limit`
pub async fn read_until_closed(stream: &mut TcpStream, limit: Duration) -> Vec<u8> {
    let mut out = Vec::new();
    match timeout(limit, stream.read_to_end(&mut out)).await {
        Ok(_) => out,
        Err(_) => panic!("Stream was not closed within {:?}", limit),
    }
}
