//! Integration tests for the HTTP and viewer WebSocket surface.
//!
//! Each test serves a started `WallContext` on an ephemeral port and talks
//! to it with a real WebSocket client.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use wall_core::PhotoRecord;
use walld::config::{KeepaliveConfig, RelayConfig, WallConfig};
use walld::relay::MemoryRelay;
use walld::{server, WallContext};

// ============================================================================
// Test Helpers
// ============================================================================

const WAIT_TIMEOUT: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestWall {
    ctx: Arc<WallContext>,
    addr: SocketAddr,
    server: JoinHandle<()>,
}

impl TestWall {
    async fn spawn(config: WallConfig) -> Self {
        let ctx = WallContext::new(config, Arc::new(MemoryRelay::new())).into_shared();
        ctx.start().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = Arc::clone(&ctx);
        let server = tokio::spawn(async move {
            let _ = server::serve_on(serving, listener).await;
        });

        // Listener must be subscribed before anything is published.
        let start = Instant::now();
        while !ctx.relay_status().is_connected() {
            assert!(start.elapsed() < WAIT_TIMEOUT, "relay listener never connected");
            sleep(POLL_INTERVAL).await;
        }

        Self { ctx, addr, server }
    }

    async fn viewer(&self, path: &str) -> Ws {
        let before = self.ctx.registry().len();
        let (ws, _) = connect_async(format!("ws://{}{}", self.addr, path))
            .await
            .expect("websocket handshake");
        self.wait_for_connections(before + 1).await;
        ws
    }

    async fn wait_for_connections(&self, expected: usize) {
        let start = Instant::now();
        while self.ctx.registry().len() != expected {
            assert!(
                start.elapsed() < WAIT_TIMEOUT,
                "expected {expected} connections, have {}",
                self.ctx.registry().len()
            );
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Sends a raw HTTP/1.1 upload and returns the response head and body.
    async fn upload(&self, body: &[u8]) -> String {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let head = format!(
            "POST /upload HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.addr,
            body.len()
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(body).await.unwrap();

        let mut response = String::new();
        timeout(WAIT_TIMEOUT, stream.read_to_string(&mut response))
            .await
            .expect("upload response timed out")
            .unwrap();
        response
    }

    async fn stop(self) {
        self.ctx.shutdown().await;
        timeout(WAIT_TIMEOUT, self.server)
            .await
            .expect("server did not stop")
            .unwrap();
    }
}

fn test_config() -> WallConfig {
    WallConfig {
        workers: 2,
        permits: 2,
        pools: 2,
        shutdown_grace_ms: 500,
        relay: RelayConfig {
            restart_initial_ms: 10,
            restart_max_ms: 50,
            ..RelayConfig::default()
        },
        ..WallConfig::default()
    }
}

async fn next_text(ws: &mut Ws) -> String {
    loop {
        let msg = timeout(WAIT_TIMEOUT, ws.next())
            .await
            .expect("no frame from server")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return text.as_str().to_owned();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_upload_reaches_every_viewer() {
    let wall = TestWall::spawn(test_config()).await;

    let mut first = wall.viewer("/ws").await;
    let mut second = wall.viewer("/ws/1").await;

    let response = wall.upload(b"\x89PNG fake image").await;
    assert!(response.starts_with("HTTP/1.1 202"), "{response}");
    assert!(response.contains("\"queued\""));

    for ws in [&mut first, &mut second] {
        let record = PhotoRecord::from_json(&next_text(ws).await).unwrap();
        assert_eq!(record.decode_image().unwrap(), b"\x89PNG fake image");
    }

    wall.stop().await;
}

#[tokio::test]
async fn test_ping_is_answered_with_pong() {
    let wall = TestWall::spawn(test_config()).await;
    let mut ws = wall.viewer("/ws").await;

    ws.send(Message::text("ping")).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "pong");

    wall.stop().await;
}

#[tokio::test]
async fn test_unknown_pool_is_refused() {
    let wall = TestWall::spawn(test_config()).await;

    let result = connect_async(format!("ws://{}/ws/7", wall.addr)).await;
    assert!(result.is_err());
    assert!(wall.ctx.registry().is_empty());

    wall.stop().await;
}

#[tokio::test]
async fn test_close_removes_connection() {
    let wall = TestWall::spawn(test_config()).await;
    let mut ws = wall.viewer("/ws").await;

    ws.close(None).await.unwrap();
    wall.wait_for_connections(0).await;

    wall.stop().await;
}

#[tokio::test]
async fn test_silent_viewer_is_pruned_by_keepalive() {
    let wall = TestWall::spawn(WallConfig {
        keepalive: KeepaliveConfig {
            liveness_window_secs: 1,
            sweep_interval_secs: 1,
        },
        ..test_config()
    })
    .await;

    let mut ws = wall.viewer("/ws").await;
    wall.wait_for_connections(0).await;

    // The server closes its end once the connection is pruned.
    let ended = timeout(WAIT_TIMEOUT, async {
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    })
    .await;
    assert!(ended.is_ok());

    wall.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_viewers() {
    let wall = TestWall::spawn(test_config()).await;
    let mut ws = wall.viewer("/ws").await;
    let ctx = Arc::clone(&wall.ctx);

    wall.stop().await;
    assert!(ctx.registry().is_empty());

    let ended = timeout(WAIT_TIMEOUT, async {
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    })
    .await;
    assert!(ended.is_ok());
}

#[tokio::test]
async fn test_serve_until_returns_after_full_teardown() {
    let ctx = WallContext::new(test_config(), Arc::new(MemoryRelay::new())).into_shared();
    ctx.start().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let serving = Arc::clone(&ctx);
    let server = tokio::spawn(async move {
        server::serve_until(serving, listener, async move {
            let _ = stop_rx.await;
        })
        .await
    });

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let start = Instant::now();
    while ctx.registry().len() != 1 {
        assert!(start.elapsed() < WAIT_TIMEOUT, "viewer never registered");
        sleep(POLL_INTERVAL).await;
    }

    stop_tx.send(()).unwrap();
    let report = timeout(WAIT_TIMEOUT, server)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();

    // Everything is torn down by the time the call returns.
    assert_eq!(report.connections_closed, 1);
    assert!(report.aborted.is_empty());
    assert!(ctx.registry().is_empty());
    assert!(ctx.supervisor().running().is_empty());
    assert!(ctx.queue().is_closed());

    let ended = timeout(WAIT_TIMEOUT, async {
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    })
    .await;
    assert!(ended.is_ok());
}
