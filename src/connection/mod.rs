//! Identity registry
//!
//! [`ConnectionManager`] is the single source of truth for which device-side
//! session and which upstream proxy belong to an identity. Every mutation for
//! one identity goes through that identity's gate, so "close old, install new"
//! is one atomic step and concurrent upstream dials collapse into one.

pub mod events;
pub mod state;

pub use events::{EventBus, HubEvent};
pub use state::{next_state, ConnectionState, ConnectionTrigger};

use crate::cloud::{CloudConnectionState, CloudProxy, CloudProxyConfig, UpstreamTransport};
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::identity::{Credentials, Identity};
use crate::message::Message;
use crate::observability::metrics;
use crate::twin::TwinPatch;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Device-side handle owned by the transport adapter
///
/// The hub uses it to push traffic down to a connected device or module and
/// to instruct the transport to drop the session.
#[async_trait]
pub trait DeviceProxy: Send + Sync {
    /// Tell the transport to disconnect the session
    async fn close(&self, reason: &str) -> HubResult<()>;

    /// Deliver a routed message to a module input
    async fn send_message(&self, message: &Message, input: &str) -> HubResult<()>;

    async fn send_desired_properties(&self, patch: &TwinPatch) -> HubResult<()>;

    async fn send_cloud_message(&self, message: &Message) -> HubResult<()>;

    fn is_active(&self) -> bool;
}

/// Registry timing
#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    /// Bound on telling a superseded session to go away
    pub replace_timeout: Duration,
    /// Disconnected connections are closed after this window
    pub disconnect_grace: Duration,
    pub proxy: CloudProxyConfig,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            replace_timeout: Duration::from_secs(5),
            disconnect_grace: Duration::from_secs(5),
            proxy: CloudProxyConfig::default(),
        }
    }
}

impl ConnectionManagerConfig {
    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            replace_timeout: Duration::from_secs(config.connections.replace_timeout_secs),
            disconnect_grace: Duration::from_secs(config.connections.disconnect_grace_secs),
            proxy: CloudProxyConfig::from_config(config),
        }
    }
}

/// One logical session for an identity
#[derive(Clone)]
pub struct Connection {
    id: u64,
    identity: Identity,
    state: ConnectionState,
    device: Arc<dyn DeviceProxy>,
    credentials: Credentials,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl Connection {
    /// Registry-unique id, used to ignore stale callbacks from superseded sessions
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn device(&self) -> &Arc<dyn DeviceProxy> {
        &self.device
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    fn transition(&mut self, trigger: ConnectionTrigger) -> bool {
        match next_state(self.state, trigger) {
            Some(next) => {
                debug!(identity = %self.identity, from = %self.state, to = %next, "Connection state changed");
                self.state = next;
                self.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("state", &self.state)
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[derive(Default)]
struct IdentitySlot {
    connection: Option<Connection>,
    cloud: Option<CloudProxy>,
    /// Pending grace-window timer for a disconnected connection
    grace: Option<CancellationToken>,
}

#[derive(Default)]
struct IdentityEntry {
    slot: Mutex<IdentitySlot>,
    /// Held across an upstream dial so concurrent callers share it
    dial: Mutex<()>,
    /// Serializes `connect` calls for the identity
    connect: Mutex<()>,
}

/// Authoritative identity -> (device session, upstream proxy) registry
pub struct ConnectionManager {
    entries: DashMap<Identity, Arc<IdentityEntry>>,
    transport: Arc<dyn UpstreamTransport>,
    config: ConnectionManagerConfig,
    events: EventBus,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn UpstreamTransport>,
        config: ConnectionManagerConfig,
        events: EventBus,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            transport,
            config,
            events,
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn entry(&self, identity: &Identity) -> Arc<IdentityEntry> {
        Arc::clone(
            self.entries
                .entry(identity.clone())
                .or_insert_with(|| Arc::new(IdentityEntry::default()))
                .value(),
        )
    }

    /// Register a new logical connection, superseding any existing one
    ///
    /// The previous session is told to disconnect before the new one is
    /// installed. If it does not acknowledge within the replace timeout the
    /// close is retried once; a second failure is an `IdentityConflict` and the
    /// registry is left unchanged.
    pub async fn connect(
        &self,
        identity: &Identity,
        credentials: Credentials,
        device: Arc<dyn DeviceProxy>,
    ) -> HubResult<Connection> {
        let entry = self.entry(identity);
        let _connecting = entry.connect.lock().await;

        let previous = {
            let slot = entry.slot.lock().await;
            slot.connection.clone().filter(|c| !c.state.is_closed())
        };
        // The slot stays unlocked here: closing may call back into disconnect
        if let Some(previous) = previous {
            if previous.state == ConnectionState::Connected {
                self.close_superseded(&previous).await?;
            }
            metrics().connection_replaced();
            info!(%identity, previous = previous.id, "Superseding existing connection");
        }

        let mut slot = entry.slot.lock().await;
        if let Some(previous) = slot.connection.as_mut() {
            previous.transition(ConnectionTrigger::Close);
        }
        if let Some(grace) = slot.grace.take() {
            grace.cancel();
        }

        let now = Utc::now();
        let mut connection = Connection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            identity: identity.clone(),
            state: ConnectionState::Idle,
            device,
            credentials: credentials.clone(),
            created_at: now,
            last_activity: now,
        };
        connection.transition(ConnectionTrigger::Authenticated);
        slot.connection = Some(connection.clone());

        if let Some(cloud) = slot.cloud.as_ref() {
            cloud.update_credentials(credentials);
        }
        drop(slot);

        metrics().device_connected();
        self.events.publish(HubEvent::DeviceConnectivity {
            identity: identity.clone(),
            connected: true,
        });
        info!(%identity, connection = connection.id, "Device connected");
        Ok(connection)
    }

    async fn close_superseded(&self, previous: &Connection) -> HubResult<()> {
        for attempt in 1..=2 {
            match tokio::time::timeout(
                self.config.replace_timeout,
                previous.device.close("superseded by a new connection"),
            )
            .await
            {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    warn!(identity = %previous.identity, attempt, error = %e, "Closing superseded session failed")
                }
                Err(_) => {
                    warn!(identity = %previous.identity, attempt, "Closing superseded session timed out")
                }
            }
        }
        Err(HubError::IdentityConflict(previous.identity.clone()))
    }

    /// Upstream proxy for `identity`, dialing if there is none yet
    ///
    /// Concurrent callers for one identity are coalesced: the first dials and
    /// the rest wait for its result, so there is at most one dial in flight.
    /// The wait is cancelled by `cancel` or hub shutdown.
    pub async fn get_or_create_cloud_proxy(
        &self,
        identity: &Identity,
        credentials: Credentials,
        cancel: &CancellationToken,
    ) -> HubResult<CloudProxy> {
        let entry = self.entry(identity);
        let _dial = tokio::select! {
            _ = cancel.cancelled() => return Err(HubError::Cancelled),
            guard = entry.dial.lock() => guard,
        };

        let proxy = {
            let mut slot = entry.slot.lock().await;
            match slot.cloud.as_ref() {
                Some(existing) if !existing.state().is_terminal() => existing.clone(),
                _ => {
                    let proxy = CloudProxy::new(
                        identity.clone(),
                        credentials,
                        Arc::clone(&self.transport),
                        self.config.proxy.clone(),
                        self.events.clone(),
                    );
                    slot.cloud = Some(proxy.clone());
                    proxy
                }
            }
        };

        if proxy.is_connected() {
            return Ok(proxy);
        }

        let open_cancel = self.shutdown.child_token();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(HubError::Cancelled),
            result = proxy.open(&open_cancel) => result,
        };
        open_cancel.cancel();

        match result {
            Ok(()) => Ok(proxy),
            Err(e) if e.is_fatal() => {
                self.force_close(identity, &e.to_string()).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Existing upstream proxy, without dialing
    pub async fn cloud_proxy(&self, identity: &Identity) -> Option<CloudProxy> {
        let entry = self.entries.get(identity).map(|e| Arc::clone(e.value()))?;
        let slot = entry.slot.lock().await;
        slot.cloud.clone()
    }

    /// Device handle of the live connection for `identity`
    pub async fn device_proxy(&self, identity: &Identity) -> Option<Arc<dyn DeviceProxy>> {
        self.connection(identity)
            .await
            .filter(|c| c.state.is_connected())
            .map(|c| Arc::clone(&c.device))
    }

    pub async fn connection(&self, identity: &Identity) -> Option<Connection> {
        let entry = self.entries.get(identity).map(|e| Arc::clone(e.value()))?;
        let slot = entry.slot.lock().await;
        slot.connection.clone().filter(|c| !c.state.is_closed())
    }

    pub async fn connection_state(&self, identity: &Identity) -> Option<ConnectionState> {
        self.connection(identity).await.map(|c| c.state)
    }

    /// Credentials of the live connection, used to re-create its upstream proxy
    pub async fn credentials(&self, identity: &Identity) -> Option<Credentials> {
        self.connection(identity).await.map(|c| c.credentials)
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn connected_count(&self) -> usize {
        let entries: Vec<_> = self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        let mut count = 0;
        for entry in entries {
            let slot = entry.slot.lock().await;
            if slot.connection.as_ref().is_some_and(|c| c.state.is_connected()) {
                count += 1;
            }
        }
        count
    }

    /// Transition the connection to Disconnected and start the grace window
    ///
    /// The upstream proxy survives a re-authentication inside the window;
    /// otherwise it is closed after in-flight sends drain. Stored messages are
    /// never touched.
    pub async fn disconnect(&self, identity: &Identity) -> HubResult<()> {
        self.disconnect_connection(identity, None).await
    }

    /// Disconnect only if `connection_id` is still the registered connection
    pub async fn disconnect_connection(
        &self,
        identity: &Identity,
        connection_id: Option<u64>,
    ) -> HubResult<()> {
        let Some(entry) = self.entries.get(identity).map(|e| Arc::clone(e.value())) else {
            return Err(HubError::NotFound(format!("no connection for {identity}")));
        };

        let mut slot = entry.slot.lock().await;
        let Some(connection) = slot.connection.as_mut() else {
            return Err(HubError::NotFound(format!("no connection for {identity}")));
        };
        if connection_id.is_some_and(|id| id != connection.id) {
            debug!(%identity, stale = ?connection_id, "Ignoring disconnect from superseded session");
            return Ok(());
        }
        if !connection.transition(ConnectionTrigger::TransportLost) {
            return Ok(());
        }
        let closed_immediately = connection.state.is_closed();
        let connection_id = connection.id;

        let grace = CancellationToken::new();
        if let Some(previous) = slot.grace.replace(grace.clone()) {
            previous.cancel();
        }
        drop(slot);

        metrics().device_disconnected();
        self.events.publish(HubEvent::DeviceConnectivity {
            identity: identity.clone(),
            connected: false,
        });
        info!(%identity, connection = connection_id, "Device disconnected");

        let grace_window = if closed_immediately {
            Duration::ZERO
        } else {
            self.config.disconnect_grace
        };
        self.spawn_grace_timer(identity.clone(), entry, connection_id, grace, grace_window);
        Ok(())
    }

    fn spawn_grace_timer(
        &self,
        identity: Identity,
        entry: Arc<IdentityEntry>,
        connection_id: u64,
        grace: CancellationToken,
        window: Duration,
    ) {
        let shutdown = self.shutdown.clone();
        let span = crate::connection_span!(identity = %identity);
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = grace.cancelled() => return,
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(window) => {}
                }

                let cloud = {
                    let mut slot = entry.slot.lock().await;
                    let expired = match slot.connection.as_mut() {
                        Some(c) if c.id == connection_id => {
                            c.transition(ConnectionTrigger::GraceExpired);
                            c.state.is_closed()
                        }
                        _ => false,
                    };
                    if !expired {
                        return;
                    }
                    slot.grace = None;
                    slot.cloud.take()
                };

                debug!(%identity, "Grace window expired, closing upstream link");
                if let Some(cloud) = cloud {
                    if let Err(e) = cloud.close_after_drain().await {
                        warn!(%identity, error = %e, "Upstream close failed");
                    }
                }
            }
            .instrument(span),
        );
    }

    /// Terminal removal of the connection and its upstream proxy
    ///
    /// The message store is not touched.
    pub async fn remove_connection(&self, identity: &Identity) -> HubResult<()> {
        let Some((_, entry)) = self.entries.remove(identity) else {
            return Err(HubError::NotFound(format!("no connection for {identity}")));
        };

        let (device, cloud) = {
            let mut slot = entry.slot.lock().await;
            if let Some(grace) = slot.grace.take() {
                grace.cancel();
            }
            let device = slot.connection.take().and_then(|mut c| {
                let was_connected = c.state.is_connected();
                c.transition(ConnectionTrigger::Close);
                was_connected.then_some(c.device)
            });
            (device, slot.cloud.take())
        };

        if let Some(device) = device {
            self.close_device(identity, device.as_ref(), "connection removed")
                .await;
            metrics().device_disconnected();
            self.events.publish(HubEvent::DeviceConnectivity {
                identity: identity.clone(),
                connected: false,
            });
        }
        self.events.publish(HubEvent::ConnectionRemoved {
            identity: identity.clone(),
        });
        if let Some(cloud) = cloud {
            cloud.close().await?;
        }
        info!(%identity, "Connection removed");
        Ok(())
    }

    /// Close the connection after a fatal upstream failure
    pub async fn force_close(&self, identity: &Identity, reason: &str) {
        let Some(entry) = self.entries.get(identity).map(|e| Arc::clone(e.value())) else {
            return;
        };

        let (device, cloud) = {
            let mut slot = entry.slot.lock().await;
            if let Some(grace) = slot.grace.take() {
                grace.cancel();
            }
            let device = match slot.connection.as_mut() {
                Some(c) if !c.state.is_closed() => {
                    let was_connected = c.state.is_connected();
                    c.transition(ConnectionTrigger::Close);
                    was_connected.then(|| Arc::clone(&c.device))
                }
                _ => None,
            };
            (device, slot.cloud.take())
        };

        if device.is_none() && cloud.is_none() {
            return;
        }
        warn!(%identity, %reason, "Force-closing connection");

        if let Some(device) = device {
            self.close_device(identity, device.as_ref(), reason).await;
            metrics().device_disconnected();
            self.events.publish(HubEvent::DeviceConnectivity {
                identity: identity.clone(),
                connected: false,
            });
        }
        if let Some(cloud) = cloud {
            if let Err(e) = cloud.close().await {
                debug!(%identity, error = %e, "Upstream close after fatal error failed");
            }
        }
    }

    async fn close_device(&self, identity: &Identity, device: &dyn DeviceProxy, reason: &str) {
        match tokio::time::timeout(self.config.replace_timeout, device.close(reason)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%identity, error = %e, "Device close failed"),
            Err(_) => warn!(%identity, "Device close timed out"),
        }
    }

    /// React to hub events: forward cloud-to-device messages and force-close
    /// identities whose upstream failed permanently
    pub fn spawn_event_handler(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut events = self.events.subscribe();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(HubEvent::CloudToDevice { identity, message }) => {
                        let manager = Arc::clone(&manager);
                        tokio::spawn(async move {
                            manager.forward_cloud_message(&identity, message).await;
                        });
                    }
                    Ok(HubEvent::CloudConnectivity {
                        identity,
                        state: CloudConnectionState::PermanentlyDisconnected(reason),
                    }) => {
                        let manager = Arc::clone(&manager);
                        tokio::spawn(async move {
                            manager.force_close(&identity, &reason).await;
                        });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Connection manager lagged behind hub events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn forward_cloud_message(&self, identity: &Identity, message: Message) {
        match self.device_proxy(identity).await {
            Some(device) => {
                if let Err(e) = device.send_cloud_message(&message).await {
                    warn!(%identity, error = %e, "Cloud-to-device delivery failed");
                }
            }
            None => debug!(%identity, "No live connection for cloud-to-device message"),
        }
    }

    /// Close every connection and upstream proxy
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let identities = self.identities();
        for identity in identities {
            if let Err(e) = self.remove_connection(&identity).await {
                debug!(%identity, error = %e, "Removal during shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::RetryPolicy;
    use crate::testing::{MockDeviceProxy, MockUpstream};

    fn manager(upstream: &MockUpstream) -> ConnectionManager {
        let config = ConnectionManagerConfig {
            replace_timeout: Duration::from_millis(100),
            disconnect_grace: Duration::from_millis(50),
            proxy: CloudProxyConfig {
                retry: RetryPolicy {
                    initial_delay: Duration::from_millis(5),
                    max_delay: Duration::from_millis(20),
                    multiplier: 2.0,
                    max_attempts: None,
                },
                drain_timeout: Duration::from_millis(50),
                ..CloudProxyConfig::default()
            },
        };
        ConnectionManager::new(Arc::new(upstream.clone()), config, EventBus::new())
    }

    fn creds() -> Credentials {
        Credentials::sas_token("SharedAccessSignature sr=x&sig=y")
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let manager = manager(&MockUpstream::new());
        let id = Identity::device("dev-1");
        let h1 = MockDeviceProxy::new();
        let h2 = MockDeviceProxy::new();

        let first = manager.connect(&id, creds(), Arc::new(h1.clone())).await.unwrap();
        let second = manager.connect(&id, creds(), Arc::new(h2.clone())).await.unwrap();

        assert!(h1.was_closed().await);
        assert!(!h2.was_closed().await);
        let current = manager.connection(&id).await.unwrap();
        assert_eq!(current.id(), second.id());
        assert_ne!(current.id(), first.id());
    }

    #[tokio::test]
    async fn test_concurrent_connects_leave_one_winner() {
        let manager = Arc::new(manager(&MockUpstream::new()));
        let id = Identity::device("dev-1");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            let id = id.clone();
            let device = MockDeviceProxy::new();
            handles.push(tokio::spawn(async move {
                let connection = manager
                    .connect(&id, creds(), Arc::new(device.clone()))
                    .await
                    .unwrap();
                (connection, device)
            }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        let current = manager.connection(&id).await.unwrap();
        let winner = results.iter().map(|(c, _)| c.id()).max().unwrap();
        assert_eq!(current.id(), winner);
        assert_eq!(manager.connected_count().await, 1);
        for (connection, device) in &results {
            if connection.id() == winner {
                assert!(device.close_reasons().await.is_empty());
            } else {
                assert_eq!(
                    device.close_reasons().await,
                    vec!["superseded by a new connection".to_string()]
                );
            }
        }

        // The registered handle is the winner's proxy
        let registered = manager.device_proxy(&id).await.unwrap();
        registered.close("winner check").await.unwrap();
        let (_, winner_device) = results.iter().find(|(c, _)| c.id() == winner).unwrap();
        assert_eq!(winner_device.close_reasons().await, vec!["winner check".to_string()]);
    }

    struct ReentrantDevice {
        manager: Arc<ConnectionManager>,
        identity: Identity,
    }

    #[async_trait]
    impl DeviceProxy for ReentrantDevice {
        async fn close(&self, _reason: &str) -> HubResult<()> {
            // Transports report the dropped session straight back
            self.manager.disconnect(&self.identity).await
        }

        async fn send_message(&self, _message: &Message, _input: &str) -> HubResult<()> {
            Ok(())
        }

        async fn send_desired_properties(&self, _patch: &TwinPatch) -> HubResult<()> {
            Ok(())
        }

        async fn send_cloud_message(&self, _message: &Message) -> HubResult<()> {
            Ok(())
        }

        fn is_active(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_superseded_close_may_report_disconnect() {
        let manager = Arc::new(manager(&MockUpstream::new()));
        let id = Identity::device("dev-1");
        let old = ReentrantDevice {
            manager: Arc::clone(&manager),
            identity: id.clone(),
        };
        manager.connect(&id, creds(), Arc::new(old)).await.unwrap();

        let second = manager
            .connect(&id, creds(), Arc::new(MockDeviceProxy::new()))
            .await
            .unwrap();

        let current = manager.connection(&id).await.unwrap();
        assert_eq!(current.id(), second.id());
        assert_eq!(current.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_replace_conflict_when_old_session_hangs() {
        let manager = manager(&MockUpstream::new());
        let id = Identity::device("dev-1");
        let stuck = MockDeviceProxy::new();
        stuck.set_close_delay(Duration::from_secs(5));

        let first = manager.connect(&id, creds(), Arc::new(stuck)).await.unwrap();
        let result = manager
            .connect(&id, creds(), Arc::new(MockDeviceProxy::new()))
            .await;

        assert!(matches!(result, Err(HubError::IdentityConflict(_))));
        assert_eq!(manager.connection(&id).await.unwrap().id(), first.id());
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_dials_once() {
        let upstream = MockUpstream::new();
        upstream.set_dial_delay(Duration::from_millis(30)).await;
        let manager = Arc::new(manager(&upstream));
        let id = Identity::device("dev-1");

        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = Arc::clone(&manager);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .get_or_create_cloud_proxy(&id, creds(), &CancellationToken::new())
                    .await
            }));
        }

        let mut proxies = Vec::new();
        for handle in handles {
            proxies.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(upstream.dial_count(), 1);
        assert!(proxies.windows(2).all(|w| w[0].ptr_eq(&w[1])));
    }

    #[tokio::test]
    async fn test_disconnect_closes_proxy_after_grace() {
        let upstream = MockUpstream::new();
        let manager = manager(&upstream);
        let id = Identity::device("dev-1");
        manager
            .connect(&id, creds(), Arc::new(MockDeviceProxy::new()))
            .await
            .unwrap();
        let proxy = manager
            .get_or_create_cloud_proxy(&id, creds(), &CancellationToken::new())
            .await
            .unwrap();

        manager.disconnect(&id).await.unwrap();
        assert_eq!(
            manager.connection_state(&id).await,
            Some(ConnectionState::Disconnected)
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(proxy.is_closed());
        assert_eq!(upstream.teardown_count(), 1);
        assert!(manager.connection(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_reconnect_within_grace_keeps_proxy() {
        let upstream = MockUpstream::new();
        let manager = manager(&upstream);
        let id = Identity::device("dev-1");
        manager
            .connect(&id, creds(), Arc::new(MockDeviceProxy::new()))
            .await
            .unwrap();
        let proxy = manager
            .get_or_create_cloud_proxy(&id, creds(), &CancellationToken::new())
            .await
            .unwrap();

        manager.disconnect(&id).await.unwrap();
        let returning = MockDeviceProxy::new();
        manager
            .connect(&id, creds(), Arc::new(returning.clone()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!proxy.is_closed());
        assert!(!returning.was_closed().await);
        assert_eq!(upstream.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_disconnect_ignored() {
        let manager = manager(&MockUpstream::new());
        let id = Identity::device("dev-1");
        let first = manager
            .connect(&id, creds(), Arc::new(MockDeviceProxy::new()))
            .await
            .unwrap();
        manager
            .connect(&id, creds(), Arc::new(MockDeviceProxy::new()))
            .await
            .unwrap();

        manager
            .disconnect_connection(&id, Some(first.id()))
            .await
            .unwrap();
        assert_eq!(
            manager.connection_state(&id).await,
            Some(ConnectionState::Connected)
        );
    }

    #[tokio::test]
    async fn test_fatal_open_force_closes_connection() {
        let upstream = MockUpstream::new();
        let id = Identity::device("dev-1");
        upstream
            .fail_next_connect(HubError::unauthorized(&id, "revoked"))
            .await;
        let manager = manager(&upstream);
        let device = MockDeviceProxy::new();
        manager
            .connect(&id, creds(), Arc::new(device.clone()))
            .await
            .unwrap();

        let result = manager
            .get_or_create_cloud_proxy(&id, creds(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(HubError::Unauthorized { .. })));
        assert!(device.was_closed().await);
        assert!(manager.connection(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_connection_is_terminal() {
        let upstream = MockUpstream::new();
        let manager = manager(&upstream);
        let id = Identity::module("edge-1", "filter");
        let device = MockDeviceProxy::new();
        manager
            .connect(&id, creds(), Arc::new(device.clone()))
            .await
            .unwrap();
        manager
            .get_or_create_cloud_proxy(&id, creds(), &CancellationToken::new())
            .await
            .unwrap();

        manager.remove_connection(&id).await.unwrap();
        assert!(device.was_closed().await);
        assert_eq!(upstream.teardown_count(), 1);
        assert!(manager.cloud_proxy(&id).await.is_none());
        assert!(matches!(
            manager.remove_connection(&id).await,
            Err(HubError::NotFound(_))
        ));
    }
}
