//! Shared utilities for integration testing.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use graceful_drain::lifecycle::startup::{self, Started};
use graceful_drain::{ServerConfig, ShutdownController, ShutdownOptions, Signal};

/// Start a server on an ephemeral port without any signal handlers.
pub async fn start_server(grace_ms: u64) -> Started {
    start_server_with_signals(grace_ms, []).await
}

/// Start a server on an ephemeral port listening for `signals`.
pub async fn start_server_with_signals(
    grace_ms: u64,
    signals: impl IntoIterator<Item = Signal>,
) -> Started {
    let mut config = ServerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();

    let signals: Vec<Signal> = signals.into_iter().collect();
    let options = ShutdownOptions::new(Duration::from_millis(grace_ms));
    let options = if signals.is_empty() {
        options.without_signals()
    } else {
        options.with_signals(signals)
    };

    startup::start(config, ShutdownController::new(), options)
        .await
        .unwrap()
}

/// Open a connection and send one raw HTTP/1.1 GET.
pub async fn send_get(addr: SocketAddr, path: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    stream
}

/// Read until the server closes the connection.
#[allow(dead_code)]
pub async fn read_to_close(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .expect("server did not close the connection")
        .unwrap_or_default();
    String::from_utf8_lossy(&buf).to_lowercase()
}

/// Read exactly one response, leaving the connection open.
#[allow(dead_code)]
pub async fn read_one_response(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .expect("no response")
            .unwrap();
        assert!(n > 0, "connection closed before a full response");
        buf.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&buf).to_lowercase();
        if let Some(end) = text.find("\r\n\r\n") {
            let length = text[..end]
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                return text;
            }
        }
    }
}
