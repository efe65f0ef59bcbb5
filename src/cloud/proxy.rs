//! Per-identity upstream proxy
//!
//! A `CloudProxy` owns at most one live [`UpstreamSession`]. It opens the
//! session with retry and an explicit per-attempt timeout, reconnects in the
//! background when the link drops, and tears the session down exactly once on
//! close no matter how many callers ask.

use super::retry::{RetryDecision, RetryPolicy};
use super::{SessionEvent, UpstreamSession, UpstreamTransport};
use crate::config::HubConfig;
use crate::connection::{EventBus, HubEvent};
use crate::error::{ErrorKind, HubError, HubResult};
use crate::identity::{Credentials, Identity};
use crate::message::Message;
use crate::observability::metrics;
use crate::twin::{TwinDocument, TwinPatch};
use arc_swap::ArcSwap;
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const TRACE_PARENT: &str = "traceparent";
pub const TRACE_STATE: &str = "tracestate";

/// Upstream link state for one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CloudConnectionState {
    /// First open attempt in progress
    Connecting,
    Connected,
    /// Link lost with reason; a reconnect is usually under way
    Disconnected(String),
    /// Retrying open (attempt count)
    Reconnecting(u32),
    /// Fatal error or retry cap reached; needs re-provisioning
    PermanentlyDisconnected(String),
    /// Closed by the hub, terminal
    Closed,
}

impl CloudConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, CloudConnectionState::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CloudConnectionState::PermanentlyDisconnected(_) | CloudConnectionState::Closed
        )
    }
}

/// Timeouts and limits for a proxy
#[derive(Debug, Clone)]
pub struct CloudProxyConfig {
    /// Bound on a single open attempt
    pub open_timeout: Duration,
    /// Bound on each send or twin call
    pub operation_timeout: Duration,
    pub max_message_size: usize,
    /// Time given to in-flight operations by `close_after_drain`
    pub drain_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for CloudProxyConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(120),
            operation_timeout: Duration::from_secs(30),
            max_message_size: 256 * 1024,
            drain_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl CloudProxyConfig {
    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            open_timeout: config.open_timeout(),
            operation_timeout: config.operation_timeout(),
            max_message_size: config.upstream.max_message_size_bytes,
            drain_timeout: Duration::from_secs(config.connections.drain_timeout_secs),
            retry: config.upstream.reconnect.retry_policy(),
        }
    }
}

struct ActiveSession {
    generation: u64,
    session: Arc<dyn UpstreamSession>,
}

struct Inner {
    identity: Identity,
    credentials: ArcSwap<Credentials>,
    transport: Arc<dyn UpstreamTransport>,
    config: CloudProxyConfig,
    session: RwLock<Option<ActiveSession>>,
    generation: AtomicU64,
    state: watch::Sender<CloudConnectionState>,
    /// Serializes open attempts so concurrent callers share one dial
    open_gate: Mutex<()>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    reconnecting: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
    events: EventBus,
}

/// Cheaply cloneable handle to one identity's upstream link
#[derive(Clone)]
pub struct CloudProxy {
    inner: Arc<Inner>,
}

struct InFlightGuard<'a> {
    inner: &'a Inner,
}

impl<'a> InFlightGuard<'a> {
    fn new(inner: &'a Inner) -> Self {
        inner.in_flight.fetch_add(1, Ordering::AcqRel);
        Self { inner }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

impl CloudProxy {
    pub fn new(
        identity: Identity,
        credentials: Credentials,
        transport: Arc<dyn UpstreamTransport>,
        config: CloudProxyConfig,
        events: EventBus,
    ) -> Self {
        let (state, _) = watch::channel(CloudConnectionState::Connecting);
        Self {
            inner: Arc::new(Inner {
                identity,
                credentials: ArcSwap::from_pointee(credentials),
                transport,
                config,
                session: RwLock::new(None),
                generation: AtomicU64::new(0),
                state,
                open_gate: Mutex::new(()),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                reconnecting: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
                events,
            }),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn state(&self) -> CloudConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CloudConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Replace the credentials used by future dials
    pub fn update_credentials(&self, credentials: Credentials) {
        self.inner.credentials.store(Arc::new(credentials));
    }

    /// Whether two handles refer to the same proxy
    pub fn ptr_eq(&self, other: &CloudProxy) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Establish the upstream link, retrying with backoff
    ///
    /// Returns once connected, or when the error is not retryable, the retry
    /// cap is reached, `cancel` fires, or the proxy is closed. Callers that
    /// arrive while another open is in progress wait for it and reuse its
    /// session instead of dialing again.
    pub async fn open(&self, cancel: &CancellationToken) -> HubResult<()> {
        let _gate = self.inner.open_gate.lock().await;

        if self.is_closed() {
            return Err(HubError::ConnectionClosed(self.inner.identity.to_string()));
        }
        if self.inner.session.read().await.is_some() {
            return Ok(());
        }

        let mut attempts = 0u32;
        if !matches!(self.state(), CloudConnectionState::Reconnecting(_)) {
            self.set_state(CloudConnectionState::Connecting);
        }

        loop {
            metrics().cloud_open_attempt();
            let error = match self.dial(cancel).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            metrics().cloud_connection_failed();

            let shutdown_requested = cancel.is_cancelled() || self.inner.shutdown.is_cancelled();
            match self
                .inner
                .config
                .retry
                .decide(&error, attempts, shutdown_requested)
            {
                RetryDecision::Retry { attempt, delay } => {
                    warn!(
                        identity = %self.inner.identity,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Upstream open failed, retrying"
                    );
                    attempts = attempt;
                    self.set_state(CloudConnectionState::Reconnecting(attempt));
                    if !self.interruptible_sleep(cancel, delay).await {
                        self.set_state(CloudConnectionState::Disconnected(
                            "open cancelled".to_string(),
                        ));
                        return Err(HubError::Cancelled);
                    }
                }
                RetryDecision::Fail(kind) => {
                    error!(
                        identity = %self.inner.identity,
                        error = %error,
                        ?kind,
                        "Upstream open failed permanently"
                    );
                    let reason = error.to_string();
                    if kind == ErrorKind::Fatal {
                        self.set_state(CloudConnectionState::PermanentlyDisconnected(reason));
                    } else {
                        self.set_state(CloudConnectionState::Disconnected(reason));
                    }
                    return Err(error);
                }
                RetryDecision::AbortShutdownRequested => {
                    self.set_state(CloudConnectionState::Disconnected(
                        "open cancelled".to_string(),
                    ));
                    return Err(HubError::Cancelled);
                }
                RetryDecision::AbortMaxAttemptsExceeded => {
                    let reason = format!("gave up after {attempts} reconnection attempts: {error}");
                    self.set_state(CloudConnectionState::PermanentlyDisconnected(reason));
                    return Err(error);
                }
            }
        }
    }

    /// One dial under the open timeout
    async fn dial(&self, cancel: &CancellationToken) -> HubResult<()> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let credentials = self.inner.credentials.load_full();
        let open_timeout = self.inner.config.open_timeout;

        let session = tokio::select! {
            _ = cancel.cancelled() => return Err(HubError::Cancelled),
            _ = self.inner.shutdown.cancelled() => return Err(HubError::Cancelled),
            result = tokio::time::timeout(
                open_timeout,
                self.inner.transport.connect(&self.inner.identity, &credentials, events_tx),
            ) => match result {
                Ok(result) => result?,
                Err(_) => return Err(HubError::Timeout(open_timeout)),
            },
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let mut slot = self.inner.session.write().await;
            // close() sets the flag before taking this lock
            if self.is_closed() {
                drop(slot);
                if let Err(e) = session.close().await {
                    debug!(identity = %self.inner.identity, error = %e, "Closing raced session");
                }
                return Err(HubError::ConnectionClosed(self.inner.identity.to_string()));
            }
            *slot = Some(ActiveSession {
                generation,
                session,
            });
        }

        self.spawn_event_pump(generation, events_rx);
        metrics().cloud_connection_established();
        self.set_state(CloudConnectionState::Connected);
        Ok(())
    }

    /// Sleep unless cancelled; false when cancelled
    async fn interruptible_sleep(&self, cancel: &CancellationToken, delay: Duration) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = self.inner.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn spawn_event_pump(&self, generation: u64, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let proxy = CloudProxy { inner };

                match event {
                    SessionEvent::DesiredPropertiesUpdated(patch) => {
                        metrics().desired_patch_received();
                        proxy.inner.events.publish(HubEvent::DesiredPropertiesUpdated {
                            identity: proxy.inner.identity.clone(),
                            patch,
                        });
                    }
                    SessionEvent::CloudToDevice(message) => {
                        if proxy.inner.identity.is_module() {
                            debug!(
                                identity = %proxy.inner.identity,
                                "Ignoring cloud-to-device message for module identity"
                            );
                            continue;
                        }
                        proxy.inner.events.publish(HubEvent::CloudToDevice {
                            identity: proxy.inner.identity.clone(),
                            message,
                        });
                    }
                    SessionEvent::Disconnected(reason) => {
                        proxy.handle_link_lost(generation, reason).await;
                        break;
                    }
                }
            }
        });
    }

    /// Drop the session of `generation` and start reconnecting
    async fn handle_link_lost(&self, generation: u64, reason: String) {
        let stale = {
            let mut slot = self.inner.session.write().await;
            match slot.as_ref() {
                Some(active) if active.generation == generation => slot.take(),
                _ => None,
            }
        };
        let Some(stale) = stale else {
            return;
        };

        metrics().cloud_connection_lost();
        warn!(identity = %self.inner.identity, reason = %reason, "Upstream link lost");
        if let Err(e) = stale.session.close().await {
            debug!(identity = %self.inner.identity, error = %e, "Closing lost session");
        }
        self.set_state(CloudConnectionState::Disconnected(reason));
        self.spawn_reconnect();
    }

    /// Fatal failure on an established session
    async fn handle_fatal(&self, generation: u64, error: &HubError) {
        let stale = {
            let mut slot = self.inner.session.write().await;
            match slot.as_ref() {
                Some(active) if active.generation == generation => slot.take(),
                _ => None,
            }
        };
        if let Some(stale) = stale {
            metrics().cloud_connection_lost();
            if let Err(e) = stale.session.close().await {
                debug!(identity = %self.inner.identity, error = %e, "Closing rejected session");
            }
        }
        error!(identity = %self.inner.identity, error = %error, "Upstream rejected credentials");
        self.set_state(CloudConnectionState::PermanentlyDisconnected(
            error.to_string(),
        ));
    }

    fn spawn_reconnect(&self) {
        if self.is_closed() || self.inner.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }

        let proxy = self.clone();
        tokio::spawn(async move {
            let cancel = proxy.inner.shutdown.child_token();
            let result = proxy.open(&cancel).await;
            proxy.inner.reconnecting.store(false, Ordering::Release);
            match result {
                Ok(()) => info!(identity = %proxy.inner.identity, "Upstream link restored"),
                Err(HubError::Cancelled) | Err(HubError::ConnectionClosed(_)) => {}
                Err(e) => {
                    warn!(identity = %proxy.inner.identity, error = %e, "Upstream reconnect gave up")
                }
            }
        });
    }

    fn set_state(&self, new_state: CloudConnectionState) {
        if self.is_closed() && new_state != CloudConnectionState::Closed {
            return;
        }
        let previous = self.inner.state.send_replace(new_state.clone());
        if previous == new_state {
            return;
        }
        log_state_transition(&self.inner.identity, &previous, &new_state);
        self.inner.events.publish(HubEvent::CloudConnectivity {
            identity: self.inner.identity.clone(),
            state: new_state,
        });
    }

    async fn active_session(&self) -> HubResult<(u64, Arc<dyn UpstreamSession>)> {
        if self.is_closed() {
            return Err(HubError::ConnectionClosed(self.inner.identity.to_string()));
        }
        match self.inner.session.read().await.as_ref() {
            Some(active) => Ok((active.generation, Arc::clone(&active.session))),
            None => Err(HubError::link_down(format!(
                "upstream for {} is not connected",
                self.inner.identity
            ))),
        }
    }

    /// Run one session call under the operation timeout and classify failures
    async fn run_operation<T, F, Fut>(&self, operation: &'static str, call: F) -> HubResult<T>
    where
        F: FnOnce(Arc<dyn UpstreamSession>) -> Fut,
        Fut: Future<Output = HubResult<T>>,
    {
        let (generation, session) = self.active_session().await?;
        let _in_flight = InFlightGuard::new(&self.inner);
        let operation_timeout = self.inner.config.operation_timeout;

        let result = match tokio::time::timeout(operation_timeout, call(session)).await {
            Ok(result) => result,
            Err(_) => Err(HubError::Timeout(operation_timeout)),
        };

        match result {
            Ok(value) => Ok(value),
            Err(HubError::Throttled) => {
                metrics().cloud_throttled();
                debug!(identity = %self.inner.identity, operation, "Upstream throttled request");
                Err(HubError::Throttled)
            }
            Err(e) if e.is_fatal() => {
                self.handle_fatal(generation, &e).await;
                Err(e)
            }
            Err(
                e @ (HubError::LinkDown { .. }
                | HubError::Timeout(_)
                | HubError::ConnectionClosed(_)),
            ) => {
                let reason = format!("{operation} failed: {e}");
                self.handle_link_lost(generation, reason.clone()).await;
                Err(HubError::link_down(reason))
            }
            Err(e) => Err(e),
        }
    }

    fn check_size(&self, message: &Message) -> HubResult<()> {
        let size = message.size();
        let limit = self.inner.config.max_message_size;
        if size > limit {
            return Err(HubError::MessageTooLarge { size, limit });
        }
        Ok(())
    }

    /// Send one message upstream
    ///
    /// Fails with `Throttled`, `MessageTooLarge` or `LinkDown`. A `LinkDown`
    /// also starts a background reconnect.
    pub async fn send(&self, message: &Message) -> HubResult<()> {
        self.check_size(message)?;
        let message = stamp_trace_context(message);
        let started = Instant::now();

        let result = self
            .run_operation("send", move |session| async move {
                session.send(&message).await
            })
            .await;

        match &result {
            Ok(()) => metrics().cloud_send_completed(started.elapsed()),
            Err(_) => metrics().cloud_send_failed(),
        }
        result
    }

    /// Send several messages, using the upstream batch call when it has one
    pub async fn send_batch(&self, messages: &[Message]) -> HubResult<()> {
        match messages {
            [] => Ok(()),
            [single] => self.send(single).await,
            _ => {
                let (_, session) = self.active_session().await?;
                if !session.supports_batch() {
                    for message in messages {
                        self.send(message).await?;
                    }
                    return Ok(());
                }

                for message in messages {
                    self.check_size(message)?;
                }
                let stamped: Vec<Message> = messages.iter().map(stamp_trace_context).collect();
                let count = stamped.len();
                let started = Instant::now();

                let result = self
                    .run_operation("send_batch", move |session| async move {
                        session.send_batch(&stamped).await
                    })
                    .await;

                match &result {
                    Ok(()) => {
                        let elapsed = started.elapsed();
                        for _ in 0..count {
                            metrics().cloud_send_completed(elapsed);
                        }
                    }
                    Err(_) => metrics().cloud_send_failed(),
                }
                result
            }
        }
    }

    pub async fn get_twin(&self) -> HubResult<TwinDocument> {
        self.run_operation("get_twin", |session| async move { session.get_twin().await })
            .await
    }

    /// Submit reported properties; returns the new reported version
    pub async fn update_reported_properties(
        &self,
        patch: &TwinPatch,
        base_version: Option<i64>,
    ) -> HubResult<i64> {
        let patch = patch.clone();
        self.run_operation("update_reported", move |session| async move {
            session.update_reported(&patch, base_version).await
        })
        .await
    }

    pub async fn complete(&self, message_id: &str) -> HubResult<()> {
        let message_id = message_id.to_string();
        self.run_operation("complete", move |session| async move {
            session.complete(&message_id).await
        })
        .await
    }

    pub async fn abandon(&self, message_id: &str) -> HubResult<()> {
        let message_id = message_id.to_string();
        self.run_operation("abandon", move |session| async move {
            session.abandon(&message_id).await
        })
        .await
    }

    /// Reject a cloud-to-device message; modules have none to reject
    pub async fn reject(&self, message_id: &str) -> HubResult<()> {
        if self.inner.identity.is_module() {
            return Err(HubError::unsupported(&self.inner.identity, "reject"));
        }
        let message_id = message_id.to_string();
        self.run_operation("reject", move |session| async move {
            session.reject(&message_id).await
        })
        .await
    }

    /// Tear down the upstream link
    ///
    /// Idempotent: only the first caller closes the session, later callers
    /// return immediately.
    pub async fn close(&self) -> HubResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!(identity = %self.inner.identity, "Upstream link already closed");
            return Ok(());
        }

        self.inner.shutdown.cancel();
        let active = self.inner.session.write().await.take();
        let result = match active {
            Some(active) => {
                metrics().cloud_connection_lost();
                active.session.close().await
            }
            None => Ok(()),
        };

        self.set_state(CloudConnectionState::Closed);
        match &result {
            Ok(()) => info!(identity = %self.inner.identity, "Upstream link closed"),
            Err(e) => {
                warn!(identity = %self.inner.identity, error = %e, "Upstream session close failed")
            }
        }
        result
    }

    /// Wait for in-flight operations, bounded by the drain timeout, then close
    pub async fn close_after_drain(&self) -> HubResult<()> {
        let drain_timeout = self.inner.config.drain_timeout;
        if tokio::time::timeout(drain_timeout, self.wait_for_drain())
            .await
            .is_err()
        {
            warn!(
                identity = %self.inner.identity,
                in_flight = self.in_flight(),
                "Closing upstream link with operations still in flight"
            );
        }
        self.close().await
    }

    async fn wait_for_drain(&self) {
        loop {
            let drained = self.inner.drained.notified();
            if self.inner.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }
}

impl fmt::Debug for CloudProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudProxy")
            .field("identity", &self.inner.identity)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Copy of `message` with a `tracestate` stamp when it carries a `traceparent`
pub fn stamp_trace_context(message: &Message) -> Message {
    if message.property(TRACE_PARENT).is_some() {
        message.with_property(TRACE_STATE, format!("timestamp={}", Utc::now().timestamp()))
    } else {
        message.clone()
    }
}

/// Log a state transition at a level matching its severity (pure logging function)
fn log_state_transition(
    identity: &Identity,
    from: &CloudConnectionState,
    to: &CloudConnectionState,
) {
    match (from, to) {
        (CloudConnectionState::Reconnecting(_), CloudConnectionState::Connected) => {
            info!(%identity, "Upstream reconnection successful");
        }
        (_, CloudConnectionState::Connected) => {
            info!(%identity, "Upstream link established");
        }
        (CloudConnectionState::Connected, CloudConnectionState::Disconnected(reason)) => {
            warn!(%identity, %reason, "Upstream link lost");
        }
        (_, CloudConnectionState::PermanentlyDisconnected(reason)) => {
            error!(%identity, %reason, "Upstream link permanently failed");
        }
        _ => {
            debug!(%identity, ?from, ?to, "Upstream link state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockUpstream;

    fn config() -> CloudProxyConfig {
        CloudProxyConfig {
            open_timeout: Duration::from_millis(200),
            operation_timeout: Duration::from_millis(200),
            max_message_size: 64,
            drain_timeout: Duration::from_millis(200),
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                multiplier: 2.0,
                max_attempts: None,
            },
        }
    }

    fn proxy(upstream: &MockUpstream, identity: Identity) -> CloudProxy {
        CloudProxy::new(
            identity,
            Credentials::sas_token("SharedAccessSignature sr=x&sig=y"),
            Arc::new(upstream.clone()),
            config(),
            EventBus::new(),
        )
    }

    fn msg(id: &str) -> Message {
        Message::builder(Identity::device("leaf-1"), id.as_bytes().to_vec())
            .message_id(id)
            .build()
    }

    #[tokio::test]
    async fn test_open_and_send() {
        let upstream = MockUpstream::new();
        let proxy = proxy(&upstream, Identity::device("leaf-1"));

        proxy.open(&CancellationToken::new()).await.unwrap();
        assert!(proxy.is_connected());

        proxy.send(&msg("m1")).await.unwrap();
        assert_eq!(upstream.sent_ids().await, vec!["m1"]);
    }

    #[tokio::test]
    async fn test_open_retries_transient_failures() {
        let upstream = MockUpstream::new();
        upstream.fail_next_connect(HubError::link_down("refused")).await;
        upstream.fail_next_connect(HubError::Timeout(Duration::from_secs(1))).await;
        let proxy = proxy(&upstream, Identity::device("leaf-1"));

        proxy.open(&CancellationToken::new()).await.unwrap();
        assert_eq!(upstream.dial_count(), 3);
        assert!(proxy.is_connected());
    }

    #[tokio::test]
    async fn test_open_stops_on_fatal_error() {
        let upstream = MockUpstream::new();
        upstream
            .fail_next_connect(HubError::unauthorized(&Identity::device("leaf-1"), "bad sas"))
            .await;
        let proxy = proxy(&upstream, Identity::device("leaf-1"));

        let result = proxy.open(&CancellationToken::new()).await;
        assert!(matches!(result, Err(HubError::Unauthorized { .. })));
        assert_eq!(upstream.dial_count(), 1);
        assert!(matches!(
            proxy.state(),
            CloudConnectionState::PermanentlyDisconnected(_)
        ));
    }

    #[tokio::test]
    async fn test_open_cancelled_while_unreachable() {
        let upstream = MockUpstream::new();
        upstream.set_reachable(false).await;
        let proxy = proxy(&upstream, Identity::device("leaf-1"));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let result = proxy.open(&cancel).await;
        assert!(matches!(result, Err(HubError::Cancelled)));
        assert!(upstream.dial_count() >= 1);
    }

    #[tokio::test]
    async fn test_open_times_out_slow_dial() {
        let upstream = MockUpstream::new();
        upstream.set_dial_delay(Duration::from_secs(5)).await;
        let mut config = config();
        config.retry.max_attempts = Some(1);
        let proxy = CloudProxy::new(
            Identity::device("leaf-1"),
            Credentials::sas_token("t"),
            Arc::new(upstream.clone()),
            config,
            EventBus::new(),
        );

        let result = proxy.open(&CancellationToken::new()).await;
        assert!(matches!(result, Err(HubError::Timeout(_))));
        assert!(matches!(
            proxy.state(),
            CloudConnectionState::PermanentlyDisconnected(_)
        ));
    }

    #[tokio::test]
    async fn test_send_rejects_oversized_message() {
        let upstream = MockUpstream::new();
        let proxy = proxy(&upstream, Identity::device("leaf-1"));
        proxy.open(&CancellationToken::new()).await.unwrap();

        let big = Message::builder(Identity::device("leaf-1"), vec![0u8; 65]).build();
        let result = proxy.send(&big).await;
        assert!(matches!(
            result,
            Err(HubError::MessageTooLarge { size: 65, limit: 64 })
        ));
        assert!(upstream.sent_messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_when_not_connected_is_link_down() {
        let upstream = MockUpstream::new();
        let proxy = proxy(&upstream, Identity::device("leaf-1"));
        let result = proxy.send(&msg("m1")).await;
        assert!(matches!(result, Err(HubError::LinkDown { .. })));
    }

    #[tokio::test]
    async fn test_send_failure_triggers_reconnect() {
        let upstream = MockUpstream::new();
        let proxy = proxy(&upstream, Identity::device("leaf-1"));
        proxy.open(&CancellationToken::new()).await.unwrap();

        upstream.fail_next_send(HubError::link_down("broken pipe")).await;
        let result = proxy.send(&msg("m1")).await;
        assert!(matches!(result, Err(HubError::LinkDown { .. })));

        let mut state = proxy.subscribe_state();
        tokio::time::timeout(Duration::from_secs(1), state.wait_for(|s| s.is_connected()))
            .await
            .expect("reconnect should complete")
            .unwrap();
        assert_eq!(upstream.dial_count(), 2);

        proxy.send(&msg("m2")).await.unwrap();
        assert_eq!(upstream.sent_ids().await, vec!["m2"]);
    }

    #[tokio::test]
    async fn test_fatal_send_tolerates_failing_session_close() {
        let upstream = MockUpstream::new();
        let proxy = proxy(&upstream, Identity::device("leaf-1"));
        proxy.open(&CancellationToken::new()).await.unwrap();

        upstream.fail_next_close(HubError::link_down("socket already gone")).await;
        upstream
            .fail_next_send(HubError::unauthorized(&Identity::device("leaf-1"), "token revoked"))
            .await;
        let result = proxy.send(&msg("m1")).await;

        assert!(matches!(result, Err(HubError::Unauthorized { .. })));
        assert!(matches!(
            proxy.state(),
            CloudConnectionState::PermanentlyDisconnected(_)
        ));
        assert_eq!(upstream.teardown_count(), 1);
        assert_eq!(upstream.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_throttled_passes_through_without_reconnect() {
        let upstream = MockUpstream::new();
        let proxy = proxy(&upstream, Identity::device("leaf-1"));
        proxy.open(&CancellationToken::new()).await.unwrap();

        upstream.fail_next_send(HubError::Throttled).await;
        assert!(matches!(proxy.send(&msg("m1")).await, Err(HubError::Throttled)));
        assert!(proxy.is_connected());
        assert_eq!(upstream.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_trace_context_stamped_on_copy() {
        let upstream = MockUpstream::new();
        let proxy = proxy(&upstream, Identity::device("leaf-1"));
        proxy.open(&CancellationToken::new()).await.unwrap();

        let traced = msg("m1").with_property(TRACE_PARENT, "00-abc-def-01");
        proxy.send(&traced).await.unwrap();

        let sent = upstream.sent_messages().await;
        assert!(sent[0].property(TRACE_STATE).unwrap().starts_with("timestamp="));
        assert!(traced.property(TRACE_STATE).is_none());

        proxy.send(&msg("m2")).await.unwrap();
        assert!(upstream.sent_messages().await[1].property(TRACE_STATE).is_none());
    }

    #[tokio::test]
    async fn test_batch_of_one_uses_single_path() {
        let upstream = MockUpstream::new();
        upstream.set_supports_batch(true);
        let proxy = proxy(&upstream, Identity::device("leaf-1"));
        proxy.open(&CancellationToken::new()).await.unwrap();

        proxy.send_batch(&[msg("m1")]).await.unwrap();
        assert_eq!(upstream.batch_count(), 0);

        proxy.send_batch(&[msg("m2"), msg("m3")]).await.unwrap();
        assert_eq!(upstream.batch_count(), 1);
        assert_eq!(upstream.sent_ids().await, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_reject_unsupported_for_modules() {
        let upstream = MockUpstream::new();
        let proxy = proxy(&upstream, Identity::module("edge", "filter"));
        proxy.open(&CancellationToken::new()).await.unwrap();

        let result = proxy.reject("lock-1").await;
        assert!(matches!(result, Err(HubError::UnsupportedOperation { .. })));
        assert!(proxy.is_connected());
    }

    #[tokio::test]
    async fn test_close_tears_down_exactly_once() {
        let upstream = MockUpstream::new();
        let proxy = proxy(&upstream, Identity::device("leaf-1"));
        proxy.open(&CancellationToken::new()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let p = proxy.clone();
            handles.push(tokio::spawn(async move { p.close().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        proxy.close().await.unwrap();

        assert_eq!(upstream.teardown_count(), 1);
        assert_eq!(proxy.state(), CloudConnectionState::Closed);
        assert!(matches!(
            proxy.send(&msg("m1")).await,
            Err(HubError::ConnectionClosed(_))
        ));
        assert!(matches!(
            proxy.open(&CancellationToken::new()).await,
            Err(HubError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_link_drop_reconnects_in_background() {
        let upstream = MockUpstream::new();
        let proxy = proxy(&upstream, Identity::device("leaf-1"));
        proxy.open(&CancellationToken::new()).await.unwrap();

        upstream.drop_link("keepalive timeout").await;

        let mut state = proxy.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(1),
            state.wait_for(|s| s.is_connected() && upstream.dial_count() == 2),
        )
        .await
        .expect("reconnect should complete")
        .unwrap();
    }

    #[tokio::test]
    async fn test_desired_patch_published_on_bus() {
        let upstream = MockUpstream::new();
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let proxy = CloudProxy::new(
            Identity::device("leaf-1"),
            Credentials::sas_token("t"),
            Arc::new(upstream.clone()),
            config(),
            events,
        );
        proxy.open(&CancellationToken::new()).await.unwrap();

        let patch = TwinPatch::from_value(serde_json::json!({"interval": 5, "$version": 2})).unwrap();
        upstream.push_desired(patch.clone()).await;

        let received = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(HubEvent::DesiredPropertiesUpdated { patch, .. }) = rx.recv().await {
                    return patch;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(received, patch);
    }
}
