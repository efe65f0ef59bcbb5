//! Shared fixtures for integration tests
#![allow(dead_code)]

use edgehub::config::RouteEntry;
use edgehub::identity::{Credentials, Identity};
use edgehub::message::Message;
use edgehub::testing::MockUpstream;
use edgehub::{Hub, HubConfig};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const EDGE_DEVICE: &str = "edge-1";

/// Hub configuration with short backoffs so reconnects happen within a test
pub fn test_config(routes: &[(&str, &str)]) -> HubConfig {
    let mut config = HubConfig::for_device(EDGE_DEVICE, "hub.example.net");
    config.upstream.open_timeout_secs = 5;
    config.upstream.operation_timeout_secs = 5;
    config.upstream.reconnect.initial_backoff_ms = 10;
    config.upstream.reconnect.max_backoff_ms = 50;
    config.connections.disconnect_grace_secs = 1;
    config.connections.replace_timeout_secs = 1;
    config.connections.drain_timeout_secs = 1;
    config.router.throttle_initial_backoff_ms = 5;
    config.router.max_throttle_wait_ms = 50;
    config.router.drain_retry_interval_secs = 1;
    config.routes = routes
        .iter()
        .map(|(name, route)| RouteEntry {
            name: name.to_string(),
            route: route.to_string(),
        })
        .collect();
    config
}

pub async fn started_hub(config: HubConfig, upstream: &MockUpstream) -> Hub {
    let hub = Hub::new(config, Arc::new(upstream.clone())).unwrap();
    hub.start().await.unwrap();
    hub
}

pub fn creds() -> Credentials {
    Credentials::sas_token("SharedAccessSignature sr=hub.example.net&sig=abc")
}

pub fn msg(origin: &Identity, id: &str) -> Message {
    Message::builder(origin.clone(), id.as_bytes().to_vec())
        .message_id(id)
        .build()
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
