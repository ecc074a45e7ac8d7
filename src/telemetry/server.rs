use std::future::IntoFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::bootstrap::{terminated, ShutdownManager};
use crate::listener::bind_tcp;

use super::metrics::CdrMetrics;

const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

/// Prometheus scrape endpoint.
pub struct MetricsServer {
    address: String,
    shutdown_timeout: Duration,
    state: Arc<ServerState>,
}

struct ServerState {
    metrics: Arc<CdrMetrics>,
    start_time: Instant,
}

impl MetricsServer {
    pub fn new(address: &str, metrics: Arc<CdrMetrics>, shutdown_timeout: Duration) -> Self {
        Self {
            address: address.to_string(),
            shutdown_timeout,
            state: Arc::new(ServerState {
                metrics,
                start_time: Instant::now(),
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(self.state.clone())
    }

    /// Bind the endpoint. Failure is logged and `None` returned; the
    /// collector keeps running without it.
    pub async fn bind(&self) -> Option<TcpListener> {
        match bind_tcp(&self.address).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                warn!(
                    address = %self.address,
                    error = %e,
                    "metrics endpoint unavailable"
                );
                None
            }
        }
    }

    /// Serve until the shutdown manager reaches `Terminated`, then drain
    /// in-flight scrapes within the shutdown timeout.
    pub async fn serve(self, listener: TcpListener, shutdown: Arc<ShutdownManager>) {
        let address = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| self.address.clone());

        info!(address = %address, "metrics server started");

        let mut stop_rx = shutdown.subscribe();
        let mut serve = tokio::spawn(
            axum::serve(listener, self.router())
                .with_graceful_shutdown(async move { terminated(&mut stop_rx).await })
                .into_future(),
        );

        let mut rx = shutdown.subscribe();
        tokio::select! {
            result = &mut serve => {
                log_exit(result);
                return;
            }
            _ = terminated(&mut rx) => {}
        }

        match tokio::time::timeout(self.shutdown_timeout, &mut serve).await {
            Ok(result) => log_exit(result),
            Err(_) => {
                serve.abort();
                warn!(
                    timeout_secs = self.shutdown_timeout.as_secs(),
                    "metrics server shutdown timed out, aborted"
                );
            }
        }
    }

    /// Bind and serve.
    pub async fn run(self, shutdown: Arc<ShutdownManager>) {
        if let Some(listener) = self.bind().await {
            self.serve(listener, shutdown).await;
        }
    }
}

fn log_exit(result: Result<std::io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => info!("metrics server stopped"),
        Ok(Err(e)) => error!(error = %e, "metrics server failed"),
        Err(e) => error!(error = %e, "metrics server task failed"),
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
}

async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, CONTENT_TYPE_TEXT)],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, CONTENT_TYPE_TEXT)],
            e.to_string(),
        ),
    }
}

async fn healthz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}
