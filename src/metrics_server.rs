//! HTTP exposition of the Prometheus metrics.
//!
//! Routes:
//! - `GET <path>` (default `/metrics`): text exposition format
//! - `GET /health`, `GET /`: `OK`
//! - anything else: `404 Not Found`

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::{ModbusError, ModbusResult};
use crate::telemetry::ModbusMetrics;

/// Content type of the Prometheus text format
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

async fn metrics_handler(State(metrics): State<Arc<ModbusMetrics>>) -> Response {
    match metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error generating metrics: {}\n", e)).into_response()
        }
    }
}

async fn health_check() -> &'static str {
    "OK\n"
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not Found\n")
}

/// Build the metrics router
pub fn create_metrics_router(metrics: Arc<ModbusMetrics>, path: &str) -> Router {
    Router::new()
        .route(path, get(metrics_handler))
        .route("/health", get(health_check))
        .route("/", get(health_check))
        .fallback(not_found)
        .with_state(metrics)
}

/// Bound metrics HTTP server
pub struct MetricsServer {
    listener: TcpListener,
    router: Router,
}

impl MetricsServer {
    /// Bind the listener; serving starts with [`MetricsServer::run`]
    pub async fn bind(addr: SocketAddr, metrics: Arc<ModbusMetrics>, path: &str) -> ModbusResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ModbusError::connection(format!("Failed to bind metrics server to {}: {}", addr, e)))?;
        Ok(Self {
            listener,
            router: create_metrics_router(metrics, path),
        })
    }

    pub fn local_addr(&self) -> ModbusResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> ModbusResult<()> {
        let addr = self.local_addr()?;
        info!("📈 Metrics server listening on http://{}", addr);
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        info!("📈 Metrics server stopped");
        Ok(())
    }
}
