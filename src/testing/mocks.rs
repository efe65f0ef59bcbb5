//! Mock implementations for testing
//!
//! Provides a scriptable upstream transport and a recording device proxy so the
//! hub can be driven end to end without a broker or a real device.

use crate::cloud::{SessionEvent, UpstreamSession, UpstreamTransport};
use crate::connection::DeviceProxy;
use crate::error::{HubError, HubResult};
use crate::identity::{Credentials, Identity};
use crate::message::Message;
use crate::twin::{TwinDocument, TwinPatch};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Default)]
struct UpstreamState {
    dials: AtomicUsize,
    teardowns: AtomicUsize,
    batches: AtomicUsize,
    unreachable: AtomicBool,
    supports_batch: AtomicBool,
    dial_delay_ms: AtomicU64,
    connect_failures: Mutex<VecDeque<HubError>>,
    send_failures: Mutex<VecDeque<HubError>>,
    reported_failures: Mutex<VecDeque<HubError>>,
    close_failures: Mutex<VecDeque<HubError>>,
    sent: Mutex<Vec<Message>>,
    reported: Mutex<Vec<(TwinPatch, Option<i64>)>>,
    completed: Mutex<Vec<String>>,
    twin: Mutex<TwinDocument>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    dialed: Mutex<Vec<Identity>>,
}

/// Scriptable upstream transport
///
/// Clones share state, so a test keeps one handle and gives another to the hub.
#[derive(Debug, Clone, Default)]
pub struct MockUpstream {
    state: Arc<UpstreamState>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `connect` calls, successful or not
    pub fn dial_count(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }

    /// Number of `close` calls on sessions
    pub fn teardown_count(&self) -> usize {
        self.state.teardowns.load(Ordering::SeqCst)
    }

    pub fn batch_count(&self) -> usize {
        self.state.batches.load(Ordering::SeqCst)
    }

    pub fn set_supports_batch(&self, supported: bool) {
        self.state.supports_batch.store(supported, Ordering::SeqCst);
    }

    pub async fn set_dial_delay(&self, delay: Duration) {
        self.state
            .dial_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make the upstream unreachable (dials and sends fail with `LinkDown`)
    ///
    /// Going unreachable also drops every live session's link.
    pub async fn set_reachable(&self, reachable: bool) {
        self.state.unreachable.store(!reachable, Ordering::SeqCst);
        if !reachable {
            self.drop_link("upstream unreachable").await;
        }
    }

    pub async fn fail_next_connect(&self, error: HubError) {
        self.state.connect_failures.lock().await.push_back(error);
    }

    pub async fn fail_next_send(&self, error: HubError) {
        self.state.send_failures.lock().await.push_back(error);
    }

    pub async fn fail_next_reported(&self, error: HubError) {
        self.state.reported_failures.lock().await.push_back(error);
    }

    /// The next session `close` tears down and then reports `error`
    pub async fn fail_next_close(&self, error: HubError) {
        self.state.close_failures.lock().await.push_back(error);
    }

    pub async fn sent_messages(&self) -> Vec<Message> {
        self.state.sent.lock().await.clone()
    }

    /// Message ids of everything sent, in order
    pub async fn sent_ids(&self) -> Vec<String> {
        self.state
            .sent
            .lock()
            .await
            .iter()
            .filter_map(|m| m.message_id().map(str::to_string))
            .collect()
    }

    pub async fn reported_patches(&self) -> Vec<(TwinPatch, Option<i64>)> {
        self.state.reported.lock().await.clone()
    }

    pub async fn completed(&self) -> Vec<String> {
        self.state.completed.lock().await.clone()
    }

    pub async fn dialed_identities(&self) -> Vec<Identity> {
        self.state.dialed.lock().await.clone()
    }

    pub async fn set_twin(&self, twin: TwinDocument) {
        *self.state.twin.lock().await = twin;
    }

    pub async fn twin(&self) -> TwinDocument {
        self.state.twin.lock().await.clone()
    }

    /// Push a desired patch to every live session
    pub async fn push_desired(&self, patch: TwinPatch) {
        self.state.twin.lock().await.apply_desired(&patch);
        for session in self.live_sessions().await {
            let _ = session
                .events
                .send(SessionEvent::DesiredPropertiesUpdated(patch.clone()));
        }
    }

    /// Push a cloud-to-device message to the live sessions of `identity`
    pub async fn push_cloud_message(&self, identity: &Identity, message: Message) {
        for session in self.live_sessions().await {
            if &session.identity == identity {
                let _ = session
                    .events
                    .send(SessionEvent::CloudToDevice(message.clone()));
            }
        }
    }

    /// Report a link loss on every live session
    pub async fn drop_link(&self, reason: &str) {
        for session in self.live_sessions().await {
            session.closed.store(true, Ordering::SeqCst);
            let _ = session
                .events
                .send(SessionEvent::Disconnected(reason.to_string()));
        }
    }

    async fn live_sessions(&self) -> Vec<Arc<MockSession>> {
        self.state
            .sessions
            .lock()
            .await
            .iter()
            .filter(|s| !s.closed.load(Ordering::SeqCst))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl UpstreamTransport for MockUpstream {
    async fn connect(
        &self,
        identity: &Identity,
        _credentials: &Credentials,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> HubResult<Arc<dyn UpstreamSession>> {
        self.state.dials.fetch_add(1, Ordering::SeqCst);
        self.state.dialed.lock().await.push(identity.clone());

        let delay = self.state.dial_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if let Some(error) = self.state.connect_failures.lock().await.pop_front() {
            return Err(error);
        }
        if self.state.unreachable.load(Ordering::SeqCst) {
            return Err(HubError::link_down("mock upstream unreachable"));
        }

        let session = Arc::new(MockSession {
            identity: identity.clone(),
            state: Arc::clone(&self.state),
            events,
            closed: AtomicBool::new(false),
        });
        self.state.sessions.lock().await.push(Arc::clone(&session));
        Ok(session)
    }
}

#[derive(Debug)]
struct MockSession {
    identity: Identity,
    state: Arc<UpstreamState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    closed: AtomicBool,
}

impl MockSession {
    fn check_link(&self) -> HubResult<()> {
        if self.closed.load(Ordering::SeqCst) || self.state.unreachable.load(Ordering::SeqCst) {
            return Err(HubError::link_down("mock session link is down"));
        }
        Ok(())
    }
}

#[async_trait]
impl UpstreamSession for MockSession {
    async fn send(&self, message: &Message) -> HubResult<()> {
        self.check_link()?;
        if let Some(error) = self.state.send_failures.lock().await.pop_front() {
            return Err(error);
        }
        self.state.sent.lock().await.push(message.clone());
        Ok(())
    }

    fn supports_batch(&self) -> bool {
        self.state.supports_batch.load(Ordering::SeqCst)
    }

    async fn send_batch(&self, messages: &[Message]) -> HubResult<()> {
        self.check_link()?;
        if let Some(error) = self.state.send_failures.lock().await.pop_front() {
            return Err(error);
        }
        self.state.batches.fetch_add(1, Ordering::SeqCst);
        self.state.sent.lock().await.extend(messages.iter().cloned());
        Ok(())
    }

    async fn get_twin(&self) -> HubResult<TwinDocument> {
        self.check_link()?;
        Ok(self.state.twin.lock().await.clone())
    }

    async fn update_reported(
        &self,
        patch: &TwinPatch,
        base_version: Option<i64>,
    ) -> HubResult<i64> {
        self.check_link()?;
        if let Some(error) = self.state.reported_failures.lock().await.pop_front() {
            return Err(error);
        }

        let mut twin = self.state.twin.lock().await;
        let version = twin.reported_version().unwrap_or(0) + 1;
        twin.apply_reported(patch, Some(version));
        self.state
            .reported
            .lock()
            .await
            .push((patch.clone(), base_version));
        Ok(version)
    }

    async fn complete(&self, message_id: &str) -> HubResult<()> {
        self.check_link()?;
        self.state
            .completed
            .lock()
            .await
            .push(message_id.to_string());
        Ok(())
    }

    async fn close(&self) -> HubResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.state.teardowns.fetch_add(1, Ordering::SeqCst);
        match self.state.close_failures.lock().await.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Recording device proxy
#[derive(Debug, Clone)]
pub struct MockDeviceProxy {
    pub closes: Arc<Mutex<Vec<String>>>,
    pub inputs: Arc<Mutex<Vec<(String, Message)>>>,
    pub desired: Arc<Mutex<Vec<TwinPatch>>>,
    pub cloud_messages: Arc<Mutex<Vec<Message>>>,
    active: Arc<AtomicBool>,
    delivery_failures: Arc<Mutex<VecDeque<(Duration, HubError)>>>,
    close_delay_ms: Arc<AtomicU64>,
}

impl Default for MockDeviceProxy {
    fn default() -> Self {
        Self {
            closes: Arc::default(),
            inputs: Arc::default(),
            desired: Arc::default(),
            cloud_messages: Arc::default(),
            active: Arc::new(AtomicBool::new(true)),
            delivery_failures: Arc::default(),
            close_delay_ms: Arc::default(),
        }
    }
}

impl MockDeviceProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next module input delivery waits `delay` and then fails with `error`
    pub async fn fail_next_delivery(&self, error: HubError, delay: Duration) {
        self.delivery_failures
            .lock()
            .await
            .push_back((delay, error));
    }

    /// Make `close` take this long to return
    pub fn set_close_delay(&self, delay: Duration) {
        self.close_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub async fn close_reasons(&self) -> Vec<String> {
        self.closes.lock().await.clone()
    }

    pub async fn was_closed(&self) -> bool {
        !self.closes.lock().await.is_empty()
    }

    pub async fn delivered_inputs(&self) -> Vec<(String, Message)> {
        self.inputs.lock().await.clone()
    }

    pub async fn desired_patches(&self) -> Vec<TwinPatch> {
        self.desired.lock().await.clone()
    }

    pub async fn received_cloud_messages(&self) -> Vec<Message> {
        self.cloud_messages.lock().await.clone()
    }

    fn check_delivery(&self) -> HubResult<()> {
        if !self.is_active() {
            return Err(HubError::link_down("mock device is not reachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceProxy for MockDeviceProxy {
    async fn close(&self, reason: &str) -> HubResult<()> {
        let delay = self.close_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.active.store(false, Ordering::SeqCst);
        self.closes.lock().await.push(reason.to_string());
        Ok(())
    }

    async fn send_message(&self, message: &Message, input: &str) -> HubResult<()> {
        self.check_delivery()?;
        let failure = self.delivery_failures.lock().await.pop_front();
        if let Some((delay, error)) = failure {
            tokio::time::sleep(delay).await;
            return Err(error);
        }
        self.inputs
            .lock()
            .await
            .push((input.to_string(), message.clone()));
        Ok(())
    }

    async fn send_desired_properties(&self, patch: &TwinPatch) -> HubResult<()> {
        self.check_delivery()?;
        self.desired.lock().await.push(patch.clone());
        Ok(())
    }

    async fn send_cloud_message(&self, message: &Message) -> HubResult<()> {
        self.check_delivery()?;
        self.cloud_messages.lock().await.push(message.clone());
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
