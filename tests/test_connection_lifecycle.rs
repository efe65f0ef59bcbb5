//! Connection registry behaviour seen through the hub
//!
//! Covers last-writer-wins replacement, single-flight upstream dialing and
//! the disconnect grace window.

mod test_helpers;

use edgehub::cloud::CloudConnectionState;
use edgehub::connection::ConnectionState;
use edgehub::identity::Identity;
use edgehub::testing::{MockDeviceProxy, MockUpstream};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{creds, eventually, started_hub, test_config};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_second_connect_supersedes_first() {
    let upstream = MockUpstream::new();
    let hub = started_hub(test_config(&[]), &upstream).await;
    let dev = Identity::device("dev-1");
    let h1 = MockDeviceProxy::new();
    let h2 = MockDeviceProxy::new();

    let first = hub
        .on_connect(dev.clone(), creds(), Arc::new(h1.clone()))
        .await
        .unwrap();
    let second = hub
        .on_connect(dev.clone(), creds(), Arc::new(h2.clone()))
        .await
        .unwrap();

    assert!(h1.was_closed().await);
    assert!(!h2.was_closed().await);
    let registered = hub.connections().connection(&dev).await.unwrap();
    assert_eq!(registered.id(), second.connection_id());
    assert_ne!(registered.id(), first.connection_id());
    assert_eq!(registered.state(), ConnectionState::Connected);
    hub.shutdown().await;
}

#[tokio::test]
async fn test_stale_listener_disconnect_leaves_new_session() {
    let upstream = MockUpstream::new();
    let hub = started_hub(test_config(&[]), &upstream).await;
    let dev = Identity::device("dev-1");

    let first = hub
        .on_connect(dev.clone(), creds(), Arc::new(MockDeviceProxy::new()))
        .await
        .unwrap();
    let second = hub
        .on_connect(dev.clone(), creds(), Arc::new(MockDeviceProxy::new()))
        .await
        .unwrap();

    hub.on_disconnect(&first).await.unwrap();

    let registered = hub.connections().connection(&dev).await.unwrap();
    assert_eq!(registered.id(), second.connection_id());
    assert_eq!(registered.state(), ConnectionState::Connected);
    hub.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_proxy_requests_share_one_dial() {
    let upstream = MockUpstream::new();
    upstream.set_dial_delay(Duration::from_millis(50)).await;
    let hub = started_hub(test_config(&[]), &upstream).await;
    let leaf = Identity::device("leaf-1");

    let mut handles = Vec::new();
    for _ in 0..10 {
        let connections = Arc::clone(hub.connections());
        let leaf = leaf.clone();
        handles.push(tokio::spawn(async move {
            connections
                .get_or_create_cloud_proxy(&leaf, creds(), &CancellationToken::new())
                .await
        }));
    }

    let mut proxies = Vec::new();
    for handle in handles {
        proxies.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(upstream.dial_count(), 1);
    assert_eq!(upstream.dialed_identities().await, vec![leaf]);
    assert!(proxies.iter().all(|p| p.ptr_eq(&proxies[0])));
    assert!(proxies[0].is_connected());
    hub.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_waiter_does_not_block_dial() {
    let upstream = MockUpstream::new();
    upstream.set_dial_delay(Duration::from_millis(100)).await;
    let hub = started_hub(test_config(&[]), &upstream).await;
    let leaf = Identity::device("leaf-1");

    let connections = Arc::clone(hub.connections());
    let dialer = {
        let leaf = leaf.clone();
        tokio::spawn(async move {
            connections
                .get_or_create_cloud_proxy(&leaf, creds(), &CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let waiter = hub
        .connections()
        .get_or_create_cloud_proxy(&leaf, creds(), &cancel)
        .await;

    assert!(waiter.is_err());
    assert!(dialer.await.unwrap().is_ok());
    assert_eq!(upstream.dial_count(), 1);
    hub.shutdown().await;
}

#[tokio::test]
async fn test_proxy_closed_once_after_grace() {
    let upstream = MockUpstream::new();
    let hub = started_hub(test_config(&[]), &upstream).await;
    let leaf = Identity::device("leaf-1");

    let listener = hub
        .on_connect(leaf.clone(), creds(), Arc::new(MockDeviceProxy::new()))
        .await
        .unwrap();
    assert!(
        eventually(|| async {
            hub.connections()
                .cloud_proxy(&leaf)
                .await
                .is_some_and(|p| p.is_connected())
        })
        .await
    );
    let proxy = hub.connections().cloud_proxy(&leaf).await.unwrap();

    hub.on_disconnect(&listener).await.unwrap();
    assert_eq!(
        hub.connections().connection_state(&leaf).await,
        Some(ConnectionState::Disconnected)
    );

    assert!(eventually(|| async { proxy.state() == CloudConnectionState::Closed }).await);
    assert_eq!(hub.connections().connection_state(&leaf).await, None);
    // Closing again is a no-op
    proxy.close().await.unwrap();
    assert_eq!(upstream.teardown_count(), 1);
    hub.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_within_grace_reuses_upstream() {
    let upstream = MockUpstream::new();
    let hub = started_hub(test_config(&[]), &upstream).await;
    let leaf = Identity::device("leaf-1");

    let listener = hub
        .on_connect(leaf.clone(), creds(), Arc::new(MockDeviceProxy::new()))
        .await
        .unwrap();
    assert!(eventually(|| async { upstream.dial_count() == 1 }).await);
    assert!(
        eventually(|| async {
            hub.connections()
                .cloud_proxy(&leaf)
                .await
                .is_some_and(|p| p.is_connected())
        })
        .await
    );

    hub.on_disconnect(&listener).await.unwrap();
    hub.on_connect(leaf.clone(), creds(), Arc::new(MockDeviceProxy::new()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert_eq!(upstream.dial_count(), 1);
    assert_eq!(upstream.teardown_count(), 0);
    assert!(hub.connections().cloud_proxy(&leaf).await.unwrap().is_connected());
    hub.shutdown().await;
}

#[tokio::test]
async fn test_fatal_upstream_error_closes_session() {
    let upstream = MockUpstream::new();
    let hub = started_hub(test_config(&[]), &upstream).await;
    let leaf = Identity::device("leaf-1");
    upstream
        .fail_next_connect(edgehub::HubError::unauthorized(&leaf, "revoked"))
        .await;
    let device = MockDeviceProxy::new();

    hub.on_connect(leaf.clone(), creds(), Arc::new(device.clone()))
        .await
        .unwrap();

    assert!(eventually(|| async { device.was_closed().await }).await);
    assert_eq!(hub.connections().connection_state(&leaf).await, None);
    hub.shutdown().await;
}
