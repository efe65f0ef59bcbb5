//! Message router
//!
//! Evaluates the current route table against each message and delivers it to
//! every matched endpoint concurrently. A destination that cannot take the
//! message right now gets it through the store instead, and a drain task per
//! `(identity, endpoint)` queue redelivers stored messages in sequence order
//! once the endpoint comes back.

use super::endpoint::{EndpointId, EndpointResolver, SystemHandler};
use super::route::RouteTable;
use crate::config::HubConfig;
use crate::connection::{EventBus, HubEvent};
use crate::error::{ErrorKind, HubError, HubResult};
use crate::message::Message;
use crate::observability::metrics;
use crate::store::{MessageStore, QueueKey};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Clone, PartialEq)]
pub struct RouterConfig {
    /// First wait after a `Throttled` answer; doubles per retry
    pub throttle_initial_backoff: Duration,
    /// Longest a single `route` call waits on a throttled endpoint before storing
    pub max_throttle_wait: Duration,
    /// How often a drain re-checks an endpoint without a connectivity signal
    pub drain_retry_interval: Duration,
    pub batch_size: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            throttle_initial_backoff: Duration::from_millis(100),
            max_throttle_wait: Duration::from_secs(5),
            drain_retry_interval: Duration::from_secs(5),
            batch_size: 10,
        }
    }
}

impl RouterConfig {
    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            throttle_initial_backoff: Duration::from_millis(config.router.throttle_initial_backoff_ms),
            max_throttle_wait: Duration::from_millis(config.router.max_throttle_wait_ms),
            drain_retry_interval: Duration::from_secs(config.router.drain_retry_interval_secs),
            batch_size: config.upstream.batch_size,
        }
    }
}

/// What happened to a message at one destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    /// Queued for the drain task
    Stored { sequence: u64 },
    /// The queue refused it
    Dropped,
    /// The endpoint can never take it
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationOutcome {
    pub endpoint: EndpointId,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoutingOutcome {
    pub matched_routes: Vec<String>,
    pub destinations: Vec<DestinationOutcome>,
}

impl RoutingOutcome {
    pub fn is_unmatched(&self) -> bool {
        self.destinations.is_empty()
    }

    pub fn all_delivered(&self) -> bool {
        !self.destinations.is_empty()
            && self
                .destinations
                .iter()
                .all(|d| d.status == DeliveryStatus::Delivered)
    }

    pub fn status(&self, endpoint: &EndpointId) -> Option<&DeliveryStatus> {
        self.destinations
            .iter()
            .find(|d| &d.endpoint == endpoint)
            .map(|d| &d.status)
    }

    pub fn stored_count(&self) -> usize {
        self.destinations
            .iter()
            .filter(|d| matches!(d.status, DeliveryStatus::Stored { .. }))
            .count()
    }
}

/// Next step after a failed delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryAction {
    Retry(Duration),
    Store,
    Reject,
}

/// Retry policy for direct delivery
///
/// Only `Throttled` is retried in-process, and only while the total wait
/// stays within `max_wait`. Configuration errors are rejected; everything
/// else goes to the store.
pub fn delivery_action(
    error: &HubError,
    waited: Duration,
    backoff: Duration,
    max_wait: Duration,
) -> DeliveryAction {
    match error {
        _ if error.kind() == ErrorKind::Configuration => DeliveryAction::Reject,
        HubError::Throttled if waited + backoff <= max_wait => DeliveryAction::Retry(backoff),
        _ => DeliveryAction::Store,
    }
}

struct DrainHandle {
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

pub struct Router {
    routes: ArcSwap<RouteTable>,
    store: Arc<MessageStore>,
    endpoints: EndpointResolver,
    config: RouterConfig,
    unmatched: AtomicU64,
    drains: DashMap<QueueKey, DrainHandle>,
    /// Held across the empty check, the direct attempt and the store fallback
    delivery_locks: DashMap<QueueKey, Arc<Mutex<()>>>,
    shutdown: CancellationToken,
}

impl Router {
    pub fn new(
        routes: RouteTable,
        store: Arc<MessageStore>,
        endpoints: EndpointResolver,
        config: RouterConfig,
    ) -> Self {
        Self {
            routes: ArcSwap::from_pointee(routes),
            store,
            endpoints,
            config,
            unmatched: AtomicU64::new(0),
            drains: DashMap::new(),
            delivery_locks: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Current route table generation
    pub fn routes(&self) -> Arc<RouteTable> {
        self.routes.load_full()
    }

    /// Swap in a new route table; in-flight `route` calls keep the old one
    pub fn update_routes(&self, routes: RouteTable) {
        let count = routes.len();
        self.routes.store(Arc::new(routes));
        metrics().routes_reloaded();
        info!(routes = count, "Route table replaced");
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn register_system_handler<S: Into<String>>(&self, name: S, handler: Arc<dyn SystemHandler>) {
        self.endpoints.register_system_handler(name, handler);
    }

    /// Messages that matched no route since startup
    pub fn unmatched_count(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    /// Route one message to every matching endpoint
    ///
    /// Transient failures never surface here: the message is stored for that
    /// destination. If any destination rejects the message for a
    /// configuration reason the first such error is returned once every
    /// destination has been tried.
    pub async fn route(
        self: &Arc<Self>,
        message: &Message,
        cancel: &CancellationToken,
    ) -> HubResult<RoutingOutcome> {
        metrics().message_received();
        let table = self.routes.load_full();
        let matched = table.destinations(message);

        if matched.is_empty() {
            self.unmatched.fetch_add(1, Ordering::Relaxed);
            metrics().message_unmatched();
            debug!(
                origin = %message.origin(),
                message_id = ?message.message_id(),
                "No route matched, message dropped"
            );
            return Ok(RoutingOutcome::default());
        }

        let deliveries = matched
            .endpoints
            .iter()
            .map(|endpoint| self.deliver(message, endpoint, cancel));
        let results = join_all(deliveries).await;

        let mut rejection = None;
        let mut destinations = Vec::with_capacity(results.len());
        for (endpoint, result) in matched.endpoints.into_iter().zip(results) {
            let status = match result {
                Ok(status) => status,
                Err(e) => {
                    let status = DeliveryStatus::Rejected(e.to_string());
                    rejection.get_or_insert(e);
                    status
                }
            };
            destinations.push(DestinationOutcome { endpoint, status });
        }

        debug!(
            origin = %message.origin(),
            routes = ?matched.routes,
            destinations = ?destinations,
            "Message routed"
        );

        match rejection {
            Some(e) => Err(e),
            None => Ok(RoutingOutcome {
                matched_routes: matched.routes,
                destinations,
            }),
        }
    }

    async fn deliver(
        self: &Arc<Self>,
        message: &Message,
        endpoint_id: &EndpointId,
        cancel: &CancellationToken,
    ) -> HubResult<DeliveryStatus> {
        let key = QueueKey::new(message.origin().clone(), endpoint_id.clone());
        let lock = Arc::clone(
            self.delivery_locks
                .entry(key.clone())
                .or_default()
                .value(),
        );
        let _ordered = lock.lock().await;

        // Older messages are still waiting; going direct would overtake them
        if !self.store.is_empty(&key).await {
            return Ok(self.store_message(&key, message).await);
        }

        let endpoint = self.endpoints.resolve(message.origin(), endpoint_id).await?;
        let started = Instant::now();
        let mut backoff = self.config.throttle_initial_backoff;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(queue = %key, "Routing cancelled, storing message");
                    return Ok(self.store_message(&key, message).await);
                }
                result = endpoint.accept(message) => result,
            };

            let error = match result {
                Ok(()) => {
                    metrics().message_delivered();
                    return Ok(DeliveryStatus::Delivered);
                }
                Err(e) => e,
            };

            match delivery_action(&error, started.elapsed(), backoff, self.config.max_throttle_wait) {
                DeliveryAction::Reject => {
                    metrics().message_failed();
                    warn!(queue = %key, error = %error, "Endpoint rejected message");
                    return Err(error);
                }
                DeliveryAction::Store => {
                    debug!(queue = %key, error = %error, "Endpoint unavailable, storing message");
                    return Ok(self.store_message(&key, message).await);
                }
                DeliveryAction::Retry(delay) => {
                    debug!(queue = %key, delay_ms = delay.as_millis() as u64, "Endpoint throttled, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Ok(self.store_message(&key, message).await);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }

    async fn store_message(self: &Arc<Self>, key: &QueueKey, message: &Message) -> DeliveryStatus {
        match self.store.enqueue(key, message.clone()).await {
            Ok(stored) => {
                metrics().message_stored();
                self.ensure_drain(key);
                DeliveryStatus::Stored {
                    sequence: stored.sequence,
                }
            }
            Err(e) => {
                debug!(queue = %key, error = %e, "Message dropped");
                DeliveryStatus::Dropped
            }
        }
    }

    fn ensure_drain(self: &Arc<Self>, key: &QueueKey) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut handle = self
            .drains
            .entry(key.clone())
            .or_insert_with(|| self.spawn_drain(key.clone()));
        if handle.task.is_finished() {
            *handle = self.spawn_drain(key.clone());
        }
    }

    fn spawn_drain(self: &Arc<Self>, key: QueueKey) -> DrainHandle {
        let wake = Arc::new(Notify::new());
        let span = crate::route_span!(queue = %key);
        let task = tokio::spawn(Arc::clone(self).run_drain(key, Arc::clone(&wake)).instrument(span));
        DrainHandle { wake, task }
    }

    async fn run_drain(self: Arc<Self>, key: QueueKey, wake: Arc<Notify>) {
        let stored = self.store.notifier(&key);
        let mut retry = tokio::time::interval(self.config.drain_retry_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        retry.tick().await;
        debug!("Drain started");

        loop {
            match self.drain_once(&key).await {
                Ok(0) => {}
                Ok(delivered) => debug!(delivered, "Drained stored messages"),
                Err(e) => debug!(error = %e, "Endpoint still unavailable"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = wake.notified() => {}
                _ = stored.notified() => {}
                _ = retry.tick() => {}
            }
        }
        debug!("Drain stopped");
    }

    /// Deliver stored messages for `key` until the queue is empty or the
    /// endpoint fails; returns how many were delivered
    pub async fn drain_once(&self, key: &QueueKey) -> HubResult<usize> {
        let mut delivered = 0;
        let mut one_at_a_time = false;

        loop {
            if self.store.is_empty(key).await {
                return Ok(delivered);
            }

            let endpoint = self.endpoints.resolve(&key.identity, &key.endpoint).await?;
            let max = if endpoint.supports_batch() && !one_at_a_time {
                self.config.batch_size
            } else {
                1
            };

            let batch = self.store.dequeue_batch(key, max).await;
            let Some(last) = batch.last().map(|entry| entry.sequence) else {
                return Ok(delivered);
            };
            let messages: Vec<Message> = batch.into_iter().map(|entry| entry.message).collect();

            match endpoint.accept_batch(&messages).await {
                Ok(()) => {
                    self.store.ack(key, last).await;
                    for _ in &messages {
                        metrics().message_delivered();
                    }
                    delivered += messages.len();
                    one_at_a_time = false;
                }
                Err(e) if e.kind() == ErrorKind::Configuration && messages.len() > 1 => {
                    // Find the offending message by retrying singly
                    self.store.rewind(key).await;
                    one_at_a_time = true;
                }
                Err(e) if e.kind() == ErrorKind::Configuration => {
                    self.store.ack(key, last).await;
                    metrics().message_failed();
                    warn!(queue = %key, sequence = last, error = %e, "Dropping stored message the endpoint refuses");
                }
                Err(e) => {
                    self.store.rewind(key).await;
                    return Err(e);
                }
            }
        }
    }

    fn wake_drains<F: Fn(&QueueKey) -> bool>(&self, filter: F) {
        for entry in self.drains.iter() {
            if filter(entry.key()) {
                entry.value().wake.notify_one();
            }
        }
    }

    fn handle_event(&self, event: &HubEvent) {
        match event {
            HubEvent::CloudConnectivity { identity, state } if state.is_connected() => {
                self.wake_drains(|key| key.endpoint == EndpointId::Upstream && &key.identity == identity);
            }
            HubEvent::DeviceConnectivity {
                identity,
                connected: true,
            } => {
                let Some(module_id) = identity.module_id() else {
                    return;
                };
                if identity.device_id() != self.endpoints.edge_device_id() {
                    return;
                }
                self.wake_drains(|key| {
                    matches!(&key.endpoint, EndpointId::ModuleInput { module_id: m, .. } if m == module_id)
                });
            }
            _ => {}
        }
    }

    /// Start drains for queues that already hold messages and follow
    /// connectivity events to wake them
    pub fn start(self: &Arc<Self>, events: &EventBus) -> JoinHandle<()> {
        for key in self.store.keys() {
            self.ensure_drain(&key);
        }

        let mut receiver = events.subscribe();
        let router = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = router.shutdown.cancelled() => break,
                    event = receiver.recv() => match event {
                        Ok(event) => router.handle_event(&event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Router fell behind hub events, waking every drain");
                            router.wake_drains(|_| true);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("Router event loop stopped");
        })
    }

    /// Stop every drain; stored messages stay in the store
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let keys: Vec<QueueKey> = self.drains.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, handle)) = self.drains.remove(&key) {
                if let Err(e) = handle.task.await {
                    warn!(queue = %key, error = %e, "Drain task ended abnormally");
                }
            }
        }
        info!("Router stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudProxyConfig, RetryPolicy};
    use crate::connection::{ConnectionManager, ConnectionManagerConfig};
    use crate::identity::{Credentials, Identity};
    use crate::store::{OverflowPolicy, StoreConfig};
    use crate::testing::{MockDeviceProxy, MockUpstream};
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct Fixture {
        upstream: MockUpstream,
        connections: Arc<ConnectionManager>,
        router: Arc<Router>,
    }

    fn fixture(routes: &[(&str, &str)], store: StoreConfig) -> Fixture {
        let upstream = MockUpstream::new();
        let config = ConnectionManagerConfig {
            proxy: CloudProxyConfig {
                retry: RetryPolicy {
                    initial_delay: Duration::from_millis(5),
                    max_delay: Duration::from_millis(20),
                    multiplier: 2.0,
                    max_attempts: None,
                },
                ..CloudProxyConfig::default()
            },
            ..ConnectionManagerConfig::default()
        };
        let connections = Arc::new(ConnectionManager::new(
            Arc::new(upstream.clone()),
            config,
            EventBus::new(),
        ));
        let resolver = EndpointResolver::new(Arc::clone(&connections), "edge-1");
        let router = Arc::new(Router::new(
            RouteTable::parse(routes.iter().copied()).unwrap(),
            Arc::new(MessageStore::new(store)),
            resolver,
            RouterConfig {
                throttle_initial_backoff: Duration::from_millis(5),
                max_throttle_wait: Duration::from_millis(50),
                drain_retry_interval: Duration::from_millis(20),
                batch_size: 10,
            },
        ));
        Fixture {
            upstream,
            connections,
            router,
        }
    }

    fn creds() -> Credentials {
        Credentials::sas_token("SharedAccessSignature sr=x&sig=y")
    }

    fn msg(origin: &Identity, id: &str) -> Message {
        Message::builder(origin.clone(), id.as_bytes().to_vec())
            .message_id(id)
            .build()
    }

    async fn connect_upstream(f: &Fixture, identity: &Identity) {
        f.connections
            .get_or_create_cloud_proxy(identity, creds(), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[test]
    fn test_delivery_action_table() {
        let max = Duration::from_millis(100);
        let ms = Duration::from_millis;
        assert_eq!(
            delivery_action(&HubError::Throttled, ms(0), ms(10), max),
            DeliveryAction::Retry(ms(10))
        );
        assert_eq!(
            delivery_action(&HubError::Throttled, ms(95), ms(10), max),
            DeliveryAction::Store
        );
        assert_eq!(
            delivery_action(&HubError::link_down("x"), ms(0), ms(10), max),
            DeliveryAction::Store
        );
        assert_eq!(
            delivery_action(&HubError::UnknownEndpoint("$x".into()), ms(0), ms(10), max),
            DeliveryAction::Reject
        );
        assert_eq!(
            delivery_action(&HubError::QueueFull { queue: "q".into(), depth: 1 }, ms(0), ms(10), max),
            DeliveryAction::Store
        );
    }

    #[tokio::test]
    async fn test_delivered_when_upstream_reachable() {
        let f = fixture(&[("all", "FROM /* INTO $upstream")], StoreConfig::default());
        let leaf = Identity::device("leaf-1");
        connect_upstream(&f, &leaf).await;

        let outcome = f.router.route(&msg(&leaf, "m1"), &CancellationToken::new()).await.unwrap();

        assert!(outcome.all_delivered());
        assert_eq!(outcome.matched_routes, vec!["all".to_string()]);
        assert_eq!(f.upstream.sent_ids().await, vec!["m1".to_string()]);
        let key = QueueKey::new(leaf, EndpointId::Upstream);
        assert!(f.router.store().is_empty(&key).await);
    }

    #[tokio::test]
    async fn test_unmatched_is_counted_not_an_error() {
        let f = fixture(&[("modules", "FROM /messages/modules/* INTO $upstream")], StoreConfig::default());
        let leaf = Identity::device("leaf-1");

        let outcome = f.router.route(&msg(&leaf, "m1"), &CancellationToken::new()).await.unwrap();

        assert!(outcome.is_unmatched());
        assert_eq!(f.router.unmatched_count(), 1);
    }

    #[tokio::test]
    async fn test_stored_without_upstream_then_drained_on_connect() {
        let f = fixture(&[("all", "FROM /* INTO $upstream")], StoreConfig::default());
        let _events = f.router.start(f.connections.events());
        let leaf = Identity::device("leaf-1");

        for id in ["m1", "m2", "m3"] {
            let outcome = f.router.route(&msg(&leaf, id), &CancellationToken::new()).await.unwrap();
            assert_eq!(outcome.stored_count(), 1);
        }
        assert!(f.upstream.sent_ids().await.is_empty());

        connect_upstream(&f, &leaf).await;

        let key = QueueKey::new(leaf, EndpointId::Upstream);
        for _ in 0..100 {
            if f.router.store().is_empty(&key).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.upstream.sent_ids().await, vec!["m1", "m2", "m3"]);
        f.router.shutdown().await;
    }

    #[tokio::test]
    async fn test_throttled_then_delivered() {
        let f = fixture(&[("all", "FROM /* INTO $upstream")], StoreConfig::default());
        let leaf = Identity::device("leaf-1");
        connect_upstream(&f, &leaf).await;
        f.upstream.fail_next_send(HubError::Throttled).await;
        f.upstream.fail_next_send(HubError::Throttled).await;

        let outcome = f.router.route(&msg(&leaf, "m1"), &CancellationToken::new()).await.unwrap();

        assert!(outcome.all_delivered());
        assert_eq!(f.upstream.sent_ids().await, vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn test_throttled_past_max_wait_is_stored() {
        let f = fixture(&[("all", "FROM /* INTO $upstream")], StoreConfig::default());
        let leaf = Identity::device("leaf-1");
        connect_upstream(&f, &leaf).await;
        for _ in 0..20 {
            f.upstream.fail_next_send(HubError::Throttled).await;
        }

        let outcome = f.router.route(&msg(&leaf, "m1"), &CancellationToken::new()).await.unwrap();

        assert_eq!(
            outcome.status(&EndpointId::Upstream),
            Some(&DeliveryStatus::Stored { sequence: 1 })
        );
    }

    #[tokio::test]
    async fn test_new_messages_queue_behind_stored_ones() {
        let f = fixture(&[("all", "FROM /* INTO $upstream")], StoreConfig::default());
        let leaf = Identity::device("leaf-1");

        f.router.route(&msg(&leaf, "m1"), &CancellationToken::new()).await.unwrap();
        // Drive the queue by hand from here on
        f.router.shutdown().await;
        connect_upstream(&f, &leaf).await;
        let outcome = f.router.route(&msg(&leaf, "m2"), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.stored_count(), 1);
        let key = QueueKey::new(leaf, EndpointId::Upstream);
        assert_eq!(f.router.drain_once(&key).await.unwrap(), 2);
        assert_eq!(f.upstream.sent_ids().await, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_queue_full_reported_as_dropped() {
        let store = StoreConfig {
            max_depth: 1,
            time_to_live: None,
            overflow: OverflowPolicy::RejectNew,
        };
        let f = fixture(&[("all", "FROM /* INTO $upstream")], store);
        let leaf = Identity::device("leaf-1");

        f.router.route(&msg(&leaf, "m1"), &CancellationToken::new()).await.unwrap();
        let outcome = f.router.route(&msg(&leaf, "m2"), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.status(&EndpointId::Upstream), Some(&DeliveryStatus::Dropped));
    }

    #[tokio::test]
    async fn test_module_endpoint_gets_input_name() {
        let f = fixture(
            &[("to-filter", "FROM /messages/modules/sensor/* INTO BrokeredEndpoint(\"/modules/filter/inputs/in1\")")],
            StoreConfig::default(),
        );
        let filter = MockDeviceProxy::new();
        f.connections
            .connect(&Identity::module("edge-1", "filter"), creds(), Arc::new(filter.clone()))
            .await
            .unwrap();

        let sensor = Identity::module("edge-1", "sensor");
        let outcome = f.router.route(&msg(&sensor, "m1"), &CancellationToken::new()).await.unwrap();

        assert!(outcome.all_delivered());
        let delivered = filter.delivered_inputs().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, "in1");
        assert_eq!(delivered[0].1.system_property("inputName"), Some("in1"));
    }

    #[tokio::test]
    async fn test_concurrent_routes_keep_order_when_first_send_fails_slowly() {
        let f = fixture(
            &[("to-filter", "FROM /messages/modules/sensor/* INTO BrokeredEndpoint(\"/modules/filter/inputs/in1\")")],
            StoreConfig::default(),
        );
        let _events = f.router.start(f.connections.events());
        let filter = MockDeviceProxy::new();
        filter
            .fail_next_delivery(HubError::link_down("input busy"), Duration::from_millis(50))
            .await;
        f.connections
            .connect(&Identity::module("edge-1", "filter"), creds(), Arc::new(filter.clone()))
            .await
            .unwrap();
        let sensor = Identity::module("edge-1", "sensor");

        let router = Arc::clone(&f.router);
        let first = msg(&sensor, "m1");
        let first = tokio::spawn(async move { router.route(&first, &CancellationToken::new()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.router.route(&msg(&sensor, "m2"), &CancellationToken::new()).await.unwrap();

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.stored_count(), 1);
        for _ in 0..100 {
            if filter.delivered_inputs().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let order: Vec<String> = filter
            .delivered_inputs()
            .await
            .iter()
            .filter_map(|(_, m)| m.message_id().map(str::to_string))
            .collect();
        assert_eq!(order, vec!["m1", "m2"]);
        f.router.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_system_endpoint_is_configuration_error() {
        let f = fixture(&[("audit", "FROM /* INTO $audit")], StoreConfig::default());
        let leaf = Identity::device("leaf-1");

        let result = f.router.route(&msg(&leaf, "m1"), &CancellationToken::new()).await;

        assert!(matches!(result, Err(HubError::UnknownEndpoint(_))));
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SystemHandler for Recorder {
        async fn handle(&self, message: &Message) -> HubResult<()> {
            self.seen
                .lock()
                .await
                .push(message.message_id().unwrap_or_default().to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_fan_out_to_system_and_upstream() {
        let f = fixture(
            &[
                ("audit", "FROM /* WHERE $messageId = 'm1' INTO $audit"),
                ("all", "FROM /* INTO $upstream"),
            ],
            StoreConfig::default(),
        );
        let recorder = Arc::new(Recorder::default());
        f.router.register_system_handler("audit", recorder.clone());
        let leaf = Identity::device("leaf-1");
        connect_upstream(&f, &leaf).await;

        let outcome = f.router.route(&msg(&leaf, "m1"), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.destinations.len(), 2);
        assert!(outcome.all_delivered());
        assert_eq!(*recorder.seen.lock().await, vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn test_update_routes_swaps_table() {
        let f = fixture(&[], StoreConfig::default());
        let leaf = Identity::device("leaf-1");
        connect_upstream(&f, &leaf).await;

        let before = f.router.route(&msg(&leaf, "m1"), &CancellationToken::new()).await.unwrap();
        f.router
            .update_routes(RouteTable::parse([("all", "FROM /* INTO $upstream")]).unwrap());
        let after = f.router.route(&msg(&leaf, "m2"), &CancellationToken::new()).await.unwrap();

        assert!(before.is_unmatched());
        assert!(after.all_delivered());
        assert_eq!(f.router.routes().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_route_stores_message() {
        let f = fixture(&[("all", "FROM /* INTO $upstream")], StoreConfig::default());
        let leaf = Identity::device("leaf-1");
        connect_upstream(&f, &leaf).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = f.router.route(&msg(&leaf, "m1"), &cancel).await.unwrap();

        assert_eq!(outcome.stored_count(), 1);
    }
}
