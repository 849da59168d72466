//! Viewer WebSocket sessions.
//!
//! Each session registers one [`Connection`] and then only reads: inbound
//! frames refresh liveness, a text `ping` is answered with `pong`, and a
//! close frame is an explicit disconnect. All writes, including broadcasts,
//! go through [`WsTransport`], which serializes them on a mutex.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use wall_core::PoolId;

use super::AppState;
use crate::context::WallContext;
use crate::keepalive::{PING, PONG};
use crate::registry::{Connection, RemovalReason, SendError, ViewerTransport};

/// Write half of a viewer socket.
pub struct WsTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsTransport {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }
}

#[async_trait]
impl ViewerTransport for WsTransport {
    async fn send_text(&self, frame: Arc<str>) -> Result<(), SendError> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(frame.to_string().into()))
            .await
            .map_err(|e| SendError::Transport(e.to_string()))
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }
}

/// GET /ws
pub(super) async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let pool = state.ctx.registry().assign_pool();
    ws.on_upgrade(move |socket| run_viewer(socket, state.ctx, pool))
}

/// GET /ws/{pool_id}
pub(super) async fn ws_pool_handler(
    ws: WebSocketUpgrade,
    Path(raw): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let pool_count = state.ctx.registry().pool_count();
    match PoolId::parse(&raw, pool_count) {
        Ok(pool) => ws.on_upgrade(move |socket| run_viewer(socket, state.ctx, pool)),
        Err(e) => {
            debug!(pool = %raw, error = %e, "Rejected viewer for unknown pool");
            (StatusCode::NOT_FOUND, e.to_string()).into_response()
        }
    }
}

async fn run_viewer(socket: WebSocket, ctx: Arc<WallContext>, pool: PoolId) {
    let (sink, mut stream) = socket.split();
    let transport = Arc::new(WsTransport::new(sink));
    let registry = Arc::clone(ctx.registry());

    let conn = Arc::new(Connection::new(
        registry.next_connection_id(),
        pool,
        Arc::clone(&transport) as Arc<dyn ViewerTransport>,
    ));
    if let Err(e) = registry.register(Arc::clone(&conn)) {
        warn!(connection = %conn.id(), error = %e, "Viewer registration failed");
        transport.close().await;
        return;
    }
    info!(
        connection = %conn.id(),
        pool = %pool,
        total = registry.len(),
        "Viewer connected"
    );

    let removed = conn.removed_token();
    let shutdown = ctx.cancel_token();
    let send_timeout = ctx.config().send_timeout();

    let reason = loop {
        let frame = tokio::select! {
            // Pruned by the broadcaster or the keepalive sweep.
            _ = removed.cancelled() => break None,
            _ = shutdown.cancelled() => break Some(RemovalReason::Shutdown),
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                conn.touch();
                if text.as_str().trim() == PING
                    && conn.send(Arc::from(PONG), send_timeout).await.is_err()
                {
                    break Some(RemovalReason::SendFailed);
                }
            }
            Some(Ok(Message::Close(_))) | None => break Some(RemovalReason::Disconnected),
            Some(Ok(_)) => conn.touch(),
            Some(Err(e)) => {
                debug!(connection = %conn.id(), error = %e, "Viewer read failed");
                break Some(RemovalReason::ReadFailed);
            }
        }
    };

    if let Some(reason) = reason {
        registry.unregister(conn.id(), reason);
    }
    transport.close().await;
    debug!(connection = %conn.id(), "Viewer session ended");
}
