//! Metrics endpoint integration tests
//!
//! Tests for /metrics and /healthz

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::task::JoinHandle;

use yaacc::bootstrap::ShutdownManager;
use yaacc::cdr::Cdr;
use yaacc::telemetry::{CdrMetrics, MetricsServer};

/// Health response
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
}

/// Test fixture that starts the endpoint on an ephemeral port
struct TestServer {
    handle: JoinHandle<()>,
    metrics: Arc<CdrMetrics>,
    shutdown: Arc<ShutdownManager>,
    base_url: String,
}

impl TestServer {
    async fn start() -> Self {
        let metrics = Arc::new(CdrMetrics::new().unwrap());
        let shutdown = ShutdownManager::new(Duration::from_secs(30));
        let server = MetricsServer::new("127.0.0.1:0", metrics.clone(), Duration::from_secs(1));

        let listener = server.bind().await.expect("bind metrics endpoint");
        let addr: SocketAddr = listener.local_addr().unwrap();
        let handle = tokio::spawn(server.serve(listener, shutdown.clone()));

        Self {
            handle,
            metrics,
            shutdown,
            base_url: format!("http://{addr}"),
        }
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        reqwest::get(format!("{}{}", self.base_url, path))
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_metrics_content_type() {
    let server = TestServer::start().await;
    let response = server.get("/metrics").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/plain; charset=utf-8"
    );
}

#[tokio::test]
async fn test_metrics_exposes_counters() {
    let server = TestServer::start().await;
    let start = DateTime::parse_from_rfc3339("2024-01-01T09:29:00+03:00").unwrap();
    let cdr = Cdr::new("10.0.0.5", start, 60)
        .with_trunks("5678", "T100")
        .with_vdn("V0001");
    server.metrics.observe(&cdr);
    server.metrics.decode_error("10.0.0.6");

    let body = server.get("/metrics").await.text().await.unwrap();
    assert!(body.contains(r#"yaacc_cdr_count{source="10.0.0.5"} 1"#), "{body}");
    assert!(body.contains(r#"yaacc_cdr_err_count{source="10.0.0.6"} 1"#));
    assert!(body.contains(r#"yaacc_cdr_vdn_duration{source="10.0.0.5",trunk="T100",vdn="V0001"} 60"#));
    assert!(body.contains(r#"direction="outbound",source="10.0.0.5",trunk="5678"} 1"#));
}

#[tokio::test]
async fn test_healthz() {
    let server = TestServer::start().await;
    let response = server.get("/healthz").await;
    assert_eq!(response.status(), StatusCode::OK);

    let health: HealthResponse = serde_json::from_str(&response.text().await.unwrap()).unwrap();
    assert_eq!(health.status, "healthy");
    assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
    assert!(health.uptime_seconds < 60);
}

#[tokio::test]
async fn test_unknown_path() {
    let server = TestServer::start().await;
    assert_eq!(server.get("/stats").await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_serves_during_drain_stops_on_terminate() {
    let server = TestServer::start().await;

    server.shutdown.start_drain();
    assert_eq!(server.get("/healthz").await.status(), StatusCode::OK);

    server.shutdown.terminate();
    tokio::time::timeout(Duration::from_secs(3), server.handle)
        .await
        .expect("metrics server did not stop")
        .unwrap();
}
