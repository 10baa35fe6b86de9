//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::Body,
    extract::ws::{WebSocket, WebSocketUpgrade},
    http::{HeaderMap, Method, Uri},
    response::IntoResponse,
    routing::{any, get},
    Router,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use http_forwarder::config::{ProxyConfig, RouteConfig};
use http_forwarder::http::HttpServer;
use http_forwarder::lifecycle::Shutdown;

/// Start a raw TCP backend that reads the request head and writes `response` verbatim.
///
/// Used for responses a well-behaved server would never produce.
pub async fn start_raw_backend(response: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut head = Vec::new();
                        let mut buf = [0u8; 1024];
                        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                            match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => head.extend_from_slice(&buf[..n]),
                            }
                        }
                        let _ = socket.write_all(response).await;
                        let _ = socket.flush().await;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        // Dropping the socket closes the connection mid-body.
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}

/// Reserve a local address with nothing listening on it.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Start an axum backend:
/// - `/ws` echoes WebSocket messages
/// - `/headers` answers with the received headers, one `name: value` per line
/// - anything else echoes the body with the method and URI in response headers
pub async fn start_echo_backend() -> SocketAddr {
    let app = Router::new()
        .route("/ws", get(ws_echo))
        .route("/headers", any(header_dump))
        .route("/", any(echo))
        .route("/{*path}", any(echo));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

async fn echo(method: Method, uri: Uri, body: Body) -> impl IntoResponse {
    (
        [
            ("x-echo-method", method.to_string()),
            ("x-echo-uri", uri.to_string()),
        ],
        body,
    )
}

async fn header_dump(headers: HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in &headers {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(value.to_str().unwrap_or("<binary>"));
        out.push('\n');
    }
    out
}

async fn ws_echo(upgrade: WebSocketUpgrade) -> impl IntoResponse {
    upgrade.on_upgrade(|mut socket: WebSocket| async move {
        while let Some(Ok(message)) = socket.recv().await {
            if socket.send(message).await.is_err() {
                break;
            }
        }
    })
}

/// A route sending everything to `destination`.
pub fn catch_all(destination: String) -> RouteConfig {
    RouteConfig {
        name: "default".into(),
        host: None,
        path_prefix: None,
        destination,
        priority: 0,
    }
}

/// Start the forwarder on an ephemeral port.
pub async fn start_forwarder(mut config: ProxyConfig) -> (SocketAddr, Shutdown) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    config.listener.bind_address = addr.to_string();
    config.listener.shutdown_grace_secs = 1;

    let shutdown = Shutdown::new();
    let server = HttpServer::new(config);
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });
    (addr, shutdown)
}

/// Forwarder with one catch-all route to `destination`.
pub async fn start_forwarder_to(destination: String) -> (SocketAddr, Shutdown) {
    let mut config = ProxyConfig::default();
    config.routes.push(catch_all(destination));
    start_forwarder(config).await
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
