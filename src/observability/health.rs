//! Health check HTTP server
//!
//! Read-only probes for operators and orchestrators: `/health`, `/ready`,
//! `/live` and `/metrics`.

use crate::cloud::CloudConnectionState;
use crate::connection::{EventBus, HubEvent};
use crate::observability::metrics::metrics;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warp::http::StatusCode;
use warp::Filter;

pub struct HealthServer {
    hub_id: String,
    port: u16,
    started: AtomicBool,
    /// Identities whose upstream link failed for good, with the reason
    upstream_failures: DashMap<String, String>,
    additional_checks: RwLock<HashMap<String, HealthCheck>>,
}

impl HealthServer {
    pub fn new<S: Into<String>>(hub_id: S, port: u16) -> Self {
        Self {
            hub_id: hub_id.into(),
            port,
            started: AtomicBool::new(false),
            upstream_failures: DashMap::new(),
            additional_checks: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::Relaxed);
    }

    pub fn record_upstream_failure(&self, identity: &str, reason: &str) {
        self.upstream_failures
            .insert(identity.to_string(), reason.to_string());
    }

    pub fn clear_upstream_failure(&self, identity: &str) {
        self.upstream_failures.remove(identity);
    }

    /// Started and no permanent upstream failure outstanding
    pub fn is_ready(&self) -> bool {
        self.started.load(Ordering::Relaxed) && self.upstream_failures.is_empty()
    }

    pub async fn add_health_check(&self, name: String, check: HealthCheck) {
        self.additional_checks.write().await.insert(name, check);
    }

    pub async fn remove_health_check(&self, name: &str) {
        self.additional_checks.write().await.remove(name);
    }

    /// Follow upstream connectivity to keep readiness current
    pub fn watch_events(self: &Arc<Self>, events: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let mut receiver = events.subscribe();
        let server = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = receiver.recv() => event,
                };
                match event {
                    Ok(HubEvent::CloudConnectivity { identity, state }) => match state {
                        CloudConnectionState::PermanentlyDisconnected(reason) => {
                            server.record_upstream_failure(&identity.to_string(), &reason);
                        }
                        // Closing the proxy after a fatal error keeps the failure
                        CloudConnectionState::Connected => {
                            server.clear_upstream_failure(&identity.to_string());
                        }
                        _ => {}
                    },
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Health watcher fell behind hub events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let health_server = Arc::clone(self);
        let ready_server = Arc::clone(self);

        // GET /health - overall status with individual checks
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = Arc::clone(&health_server);
                async move {
                    let status = server.health_status().await;
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
                }
            });

        // GET /metrics - JSON snapshot of the global collector
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().snapshot()));

        // GET /ready - readiness probe
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || {
                let ready = ready_server.is_ready();
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                warp::reply::with_status(warp::reply::json(&response), code)
            });

        // GET /live - liveness probe
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        health_route.or(metrics_route).or(ready_route).or(live_route)
    }

    /// Serve until `cancel` fires
    pub async fn start(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let address = SocketAddr::from(([0, 0, 0, 0], self.port));
        let (bound, server) = warp::serve(self.routes())
            .try_bind_with_graceful_shutdown(address, cancel.cancelled_owned())?;
        info!(address = %bound, "Health server listening");
        server.await;
        info!("Health server stopped");
        Ok(())
    }

    async fn health_status(&self) -> HealthStatus {
        let now = current_timestamp();
        let mut checks = HashMap::new();
        checks.insert("hub".to_string(), self.check_started(now));
        checks.insert("upstream".to_string(), self.check_upstream(now));

        for (name, check) in self.additional_checks.read().await.iter() {
            checks.insert(name.clone(), check.clone());
        }

        let healthy = checks.values().all(|check| check.status == "healthy");
        metrics().update_health_status(healthy);

        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: now,
            hub_id: self.hub_id.clone(),
            uptime_seconds: metrics().snapshot().lifecycle.uptime_seconds,
            checks,
        }
    }

    fn check_started(&self, now: u64) -> HealthCheck {
        if self.started.load(Ordering::Relaxed) {
            HealthCheck::healthy("Hub running", now)
        } else {
            HealthCheck {
                status: "starting".to_string(),
                message: Some("Hub has not finished starting".to_string()),
                last_check: now,
            }
        }
    }

    fn check_upstream(&self, now: u64) -> HealthCheck {
        if self.upstream_failures.is_empty() {
            return HealthCheck::healthy("No permanent upstream failures", now);
        }
        let mut failed: Vec<String> = self
            .upstream_failures
            .iter()
            .map(|entry| format!("{}: {}", entry.key(), entry.value()))
            .collect();
        failed.sort();
        HealthCheck {
            status: "unhealthy".to_string(),
            message: Some(failed.join("; ")),
            last_check: now,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    pub fn healthy(message: &str, now: u64) -> Self {
        Self {
            status: "healthy".to_string(),
            message: Some(message.to_string()),
            last_check: now,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    hub_id: String,
    uptime_seconds: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use std::time::Duration;

    #[test]
    fn test_readiness_follows_start_and_failures() {
        let server = HealthServer::new("edge-1", 0);
        assert!(!server.is_ready());

        server.set_started(true);
        assert!(server.is_ready());

        server.record_upstream_failure("leaf-1", "unauthorized");
        assert!(!server.is_ready());

        server.clear_upstream_failure("leaf-1");
        assert!(server.is_ready());
    }

    #[tokio::test]
    async fn test_ready_endpoint_status_codes() {
        let server = Arc::new(HealthServer::new("edge-1", 0));
        let routes = server.routes();

        let response = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        server.set_started(true);
        let response = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_endpoint_reports_checks() {
        let server = Arc::new(HealthServer::new("edge-1", 0));
        server.set_started(true);
        server
            .add_health_check("store".to_string(), HealthCheck::healthy("ok", 0))
            .await;
        let routes = server.routes();

        let response = warp::test::request().path("/health").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["hub_id"], "edge-1");
        assert!(body["checks"]["upstream"].is_object());
        assert!(body["checks"]["store"].is_object());

        server.remove_health_check("store").await;
        let response = warp::test::request().path("/health").reply(&routes).await;
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert!(body["checks"]["store"].is_null());

        server.record_upstream_failure("leaf-1", "unauthorized");
        let response = warp::test::request().path("/health").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_live_and_metrics_endpoints() {
        let routes = Arc::new(HealthServer::new("edge-1", 0)).routes();

        let live = warp::test::request().path("/live").reply(&routes).await;
        assert_eq!(live.status(), StatusCode::OK);

        let response = warp::test::request().path("/metrics").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert!(body["routing"].is_object());
    }

    #[tokio::test]
    async fn test_watch_events_tracks_permanent_failures() {
        let server = Arc::new(HealthServer::new("edge-1", 0));
        server.set_started(true);
        let events = EventBus::new();
        let cancel = CancellationToken::new();
        let watcher = server.watch_events(&events, cancel.clone());
        let identity = Identity::device("leaf-1");

        events.publish(HubEvent::CloudConnectivity {
            identity: identity.clone(),
            state: CloudConnectionState::PermanentlyDisconnected("unauthorized".into()),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!server.is_ready());

        events.publish(HubEvent::CloudConnectivity {
            identity,
            state: CloudConnectionState::Connected,
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(server.is_ready());

        cancel.cancel();
        watcher.await.unwrap();
    }
}
