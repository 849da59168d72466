//! HTTP and WebSocket surface.
//!
//! | Route            | Purpose                                    |
//! |------------------|--------------------------------------------|
//! | `POST /upload`   | Accept a photo and hand it to the pipeline |
//! | `GET /ws`        | Viewer socket, pool assigned round-robin   |
//! | `GET /ws/{pool}` | Viewer socket in a specific pool           |
//! | `GET /health`    | Liveness and pipeline counters             |
//! | `GET /ws-status` | Connection count per pool                  |

mod ingress;
mod viewer;

pub use viewer::WsTransport;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

use crate::context::{ShutdownReport, WallContext};
use crate::health::{HealthResponse, WsStatusResponse};

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<WallContext>,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Builds the router with every route.
pub fn router(ctx: Arc<WallContext>) -> Router {
    let body_limit = ctx.config().max_upload_bytes;
    let state = AppState { ctx };

    Router::new()
        .route(
            "/upload",
            post(ingress::upload).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/ws", get(viewer::ws_handler))
        .route("/ws/{pool_id}", get(viewer::ws_pool_handler))
        .route("/health", get(health_handler))
        .route("/ws-status", get(ws_status_handler))
        .with_state(state)
}

/// Binds the configured listen address and serves until `signal` fires.
/// See [`serve_until`].
pub async fn serve<S>(ctx: Arc<WallContext>, signal: S) -> Result<ShutdownReport, ServerError>
where
    S: Future<Output = ()>,
{
    let addr = ctx.config().listen;
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            ctx.shutdown().await;
            return Err(ServerError::Bind {
                addr,
                error: e.to_string(),
            });
        }
    };
    serve_until(ctx, listener, signal).await
}

/// Serves on `listener` until `signal` fires, then runs the context
/// shutdown and waits for it to finish before returning.
///
/// If the server stops first (an I/O error, or shutdown started
/// elsewhere) the context is still shut down before this returns.
pub async fn serve_until<S>(
    ctx: Arc<WallContext>,
    listener: TcpListener,
    signal: S,
) -> Result<ShutdownReport, ServerError>
where
    S: Future<Output = ()>,
{
    let server = serve_on(Arc::clone(&ctx), listener);
    tokio::pin!(server);

    let stopped_early = tokio::select! {
        result = &mut server => Some(result),
        () = signal => None,
    };

    let report = ctx.shutdown().await;
    match stopped_early {
        Some(result) => result?,
        None => server.await?,
    }
    Ok(report)
}

/// Serves on an already-bound listener.
pub async fn serve_on(ctx: Arc<WallContext>, listener: TcpListener) -> Result<(), ServerError> {
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "Wall server listening");

    let shutdown = ctx.cancel_token();
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Wall server stopped");
    Ok(())
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(state.ctx.health())
}

/// GET /ws-status
async fn ws_status_handler(State(state): State<AppState>) -> Json<WsStatusResponse> {
    Json(state.ctx.ws_status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WallConfig;
    use crate::relay::MemoryRelay;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn make_ctx() -> Arc<WallContext> {
        let config = WallConfig {
            pools: 3,
            ..WallConfig::default()
        };
        Arc::new(WallContext::new(config, Arc::new(MemoryRelay::new())))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (status, body) = get_json(router(make_ctx()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queue_depth"], 0);
        assert_eq!(body["queue_capacity"], 100_000);
        assert_eq!(body["relay_connected"], false);
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn test_ws_status_lists_every_pool() {
        let (status, body) = get_json(router(make_ctx()), "/ws-status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_connections"], 0);
        assert_eq!(body["pools"].as_object().unwrap().len(), 3);
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_bind_failure_still_shuts_context_down() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = WallConfig {
            listen: taken.local_addr().unwrap(),
            shutdown_grace_ms: 500,
            ..WallConfig::default()
        };
        let ctx = Arc::new(WallContext::new(config, Arc::new(MemoryRelay::new())));
        ctx.start().unwrap();

        let result = serve(Arc::clone(&ctx), std::future::pending::<()>()).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
        assert!(ctx.queue().is_closed());
        assert!(ctx.supervisor().running().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_route_returns_404() {
        let (status, _) = get_json(router(make_ctx()), "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
