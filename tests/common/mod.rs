/// Common utilities for integration tests
use std::net::{TcpListener, UdpSocket as StdUdpSocket};
use std::sync::Arc;

use nvelox::config::{self, Config};
use nvelox::engine::Engine;
use nvelox::logging::AccessLog;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;

/// Find an available TCP port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Find an available UDP port
pub fn get_available_udp_port() -> u16 {
    StdUdpSocket::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Start the engine for the given config in the background
///
/// Returns the shutdown token; cancelling it stops the engine.
pub fn spawn_engine(cfg: Config) -> CancellationToken {
    let listeners = config::expand_listeners(&cfg.listeners);
    let access_log = Arc::new(AccessLog::new(None).expect("access log"));
    let engine = Arc::new(Engine::new(&cfg, listeners, access_log).expect("engine"));

    let token = CancellationToken::new();
    let run_token = token.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.run(run_token).await {
            eprintln!("engine error: {}", e);
        }
    });
    token
}

/// Create a simple TCP echo server for testing
pub async fn start_echo_server(host: &str, port: u16) -> tokio::task::JoinHandle<()> {
    let addr = format!("{}:{}", host, port);
    tokio::spawn(async move {
        let listener = TokioTcpListener::bind(&addr)
            .await
            .expect("Failed to bind echo server");

        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 8192];
                        loop {
                            match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => {
                                    if socket.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    })
}

/// Create a UDP echo server for testing
pub async fn start_udp_echo_server(port: u16) -> tokio::task::JoinHandle<()> {
    let addr = format!("127.0.0.1:{}", port);
    tokio::spawn(async move {
        let socket = UdpSocket::bind(&addr)
            .await
            .expect("Failed to bind UDP echo server");
        let mut buf = vec![0u8; 8192];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, peer)) => {
                    let _ = socket.send_to(&buf[..n], peer).await;
                }
                Err(_) => break,
            }
        }
    })
}

/// A UDP server that tags every reply with its own port, for stickiness tests
pub async fn start_udp_tag_server(port: u16) -> tokio::task::JoinHandle<()> {
    let addr = format!("127.0.0.1:{}", port);
    tokio::spawn(async move {
        let socket = UdpSocket::bind(&addr)
            .await
            .expect("Failed to bind UDP tag server");
        let tag = port.to_string();
        let mut buf = vec![0u8; 8192];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((_, peer)) => {
                    let _ = socket.send_to(tag.as_bytes(), peer).await;
                }
                Err(_) => break,
            }
        }
    })
}

/// A TCP server that captures the first bytes it receives
pub async fn start_capture_server(
    port: u16,
    capture_len: usize,
) -> (
    tokio::task::JoinHandle<()>,
    tokio::sync::mpsc::Receiver<Vec<u8>>,
) {
    let addr = format!("127.0.0.1:{}", port);
    let (tx, rx) = tokio::sync::mpsc::channel(4);

    let handle = tokio::spawn(async move {
        let listener = TokioTcpListener::bind(&addr)
            .await
            .expect("Failed to bind capture server");

        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let mut collected = Vec::new();
                        let mut buf = vec![0u8; 8192];
                        while collected.len() < capture_len {
                            match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => collected.extend_from_slice(&buf[..n]),
                            }
                        }
                        let _ = tx.send(collected).await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    (handle, rx)
}
