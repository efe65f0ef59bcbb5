//! Health, readiness and logging surface of a running hub

mod test_helpers;

use edgehub::identity::Identity;
use edgehub::observability::{metrics, parse_level, HealthServer, LogFormat};
use edgehub::testing::{MockDeviceProxy, MockUpstream};
use edgehub::{Hub, HubError};
use std::sync::Arc;
use test_helpers::{creds, eventually, test_config};
use tracing::Level;

#[tokio::test]
async fn test_hub_reports_ready_after_start() {
    let upstream = MockUpstream::new();
    let health = Arc::new(HealthServer::new("edge-1", 0));
    let mut hub = Hub::new(test_config(&[]), Arc::new(upstream.clone())).unwrap();
    hub.set_health_server(Arc::clone(&health));
    assert!(!health.is_ready());

    hub.start().await.unwrap();
    assert!(health.is_ready());
    assert!(hub.is_started());

    let routes = health.routes();
    let response = warp::test::request().path("/ready").reply(&routes).await;
    assert_eq!(response.status(), warp::http::StatusCode::OK);

    hub.shutdown().await;
    assert!(!health.is_ready());
}

#[tokio::test]
async fn test_permanent_upstream_failure_clears_readiness() {
    let upstream = MockUpstream::new();
    let health = Arc::new(HealthServer::new("edge-1", 0));
    let mut hub = Hub::new(test_config(&[]), Arc::new(upstream.clone())).unwrap();
    hub.set_health_server(Arc::clone(&health));
    hub.start().await.unwrap();
    let leaf = Identity::device("leaf-1");
    upstream
        .fail_next_connect(HubError::unauthorized(&leaf, "certificate revoked"))
        .await;

    hub.on_connect(leaf, creds(), Arc::new(MockDeviceProxy::new()))
        .await
        .unwrap();

    assert!(eventually(|| async { !health.is_ready() }).await);
    hub.shutdown().await;
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let upstream = MockUpstream::new();
    let hub = Hub::new(test_config(&[]), Arc::new(upstream)).unwrap();
    hub.start().await.unwrap();
    hub.start().await.unwrap();
    assert!(hub.is_started());
    hub.shutdown().await;
    assert!(!hub.is_started());
}

#[test]
fn test_metrics_snapshot_serializes() {
    metrics().message_received();
    let snapshot = metrics().snapshot();
    assert!(snapshot.routing.messages_received >= 1);
    let body = serde_json::to_value(&snapshot).unwrap();
    assert!(body["store"].is_object());
}

#[test]
fn test_log_settings_parse() {
    assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("  json  "), LogFormat::Json);
    assert_eq!(parse_level("warn"), Level::WARN);
    assert_eq!(parse_level("nonsense"), Level::INFO);
}

#[test]
fn test_span_macros_are_exported() {
    let identity = Identity::device("leaf-1");
    let span = edgehub::connection_span!(identity = %identity);
    let _entered = span.enter();
    let _route = edgehub::route_span!(queue = "leaf-1/$upstream");
    let _twin = edgehub::twin_span!(identity = %identity);
}
