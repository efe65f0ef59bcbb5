//! MQTT upstream transport
//!
//! Speaks the IoT Hub MQTT topic layout over `rumqttc`. Each identity gets its
//! own client and event loop. Telemetry is published at QoS 1 and the send
//! completes when its PUBACK arrives. Twin requests are correlated by `$rid`.

use super::{SessionEvent, UpstreamSession, UpstreamTransport};
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::identity::{AuthMethod, Credentials, Identity};
use crate::message::{Message, SystemProperties};
use crate::twin::{TwinDocument, TwinPatch};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions,
    Outgoing, Packet, Publish, QoS, Transport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::form_urlencoded;

pub const API_VERSION: &str = "2021-04-12";

const REQUEST_CHANNEL_CAPACITY: usize = 256;

/// IoT Hub's device-to-cloud message limit
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Pure topic construction and parsing for the IoT Hub layout
pub mod topics {
    use crate::identity::Identity;
    use crate::message::Message;
    use url::form_urlencoded;

    pub const TWIN_RESPONSE_FILTER: &str = "$iothub/twin/res/#";
    pub const TWIN_DESIRED_FILTER: &str = "$iothub/twin/PATCH/properties/desired/#";
    pub const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
    pub const TWIN_DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";

    pub const PROP_MESSAGE_ID: &str = "$.mid";
    pub const PROP_CORRELATION_ID: &str = "$.cid";
    pub const PROP_CONTENT_TYPE: &str = "$.ct";
    pub const PROP_CONTENT_ENCODING: &str = "$.ce";

    /// Client id: the device id, or `device/module` for modules
    pub fn client_id(identity: &Identity) -> String {
        match identity.module_id() {
            Some(module) => format!("{}/{}", identity.device_id(), module),
            None => identity.device_id().to_string(),
        }
    }

    /// Username with the api version, plus the device's product info when it sent one
    pub fn username(hostname: &str, identity: &Identity, product_info: Option<&str>) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("api-version", super::API_VERSION);
        if let Some(info) = product_info {
            query.append_pair("DeviceClientType", info);
        }
        format!("{hostname}/{}/?{}", client_id(identity), query.finish())
    }

    fn events_base(identity: &Identity) -> String {
        match identity.module_id() {
            Some(module) => format!(
                "devices/{}/modules/{}/messages/events/",
                identity.device_id(),
                module
            ),
            None => format!("devices/{}/messages/events/", identity.device_id()),
        }
    }

    /// Telemetry topic with system and application properties encoded in the path
    pub fn telemetry_topic(identity: &Identity, message: &Message) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        let sp = message.system_properties();
        let system = [
            (PROP_MESSAGE_ID, sp.message_id.as_deref()),
            (PROP_CORRELATION_ID, sp.correlation_id.as_deref()),
            (PROP_CONTENT_TYPE, sp.content_type.as_deref()),
            (PROP_CONTENT_ENCODING, sp.content_encoding.as_deref()),
        ];
        for (key, value) in system {
            if let Some(value) = value {
                serializer.append_pair(key, value);
            }
        }

        let mut properties: Vec<_> = message.properties().iter().collect();
        properties.sort();
        for (key, value) in properties {
            serializer.append_pair(key, value);
        }

        format!("{}{}", events_base(identity), serializer.finish())
    }

    pub fn cloud_to_device_filter(device_id: &str) -> String {
        format!("devices/{device_id}/messages/devicebound/#")
    }

    pub fn cloud_to_device_prefix(device_id: &str) -> String {
        format!("devices/{device_id}/messages/devicebound/")
    }

    pub fn twin_get_topic(request_id: &str) -> String {
        format!("$iothub/twin/GET/?$rid={request_id}")
    }

    pub fn twin_reported_topic(request_id: &str, base_version: Option<i64>) -> String {
        match base_version {
            Some(version) => format!(
                "$iothub/twin/PATCH/properties/reported/?$rid={request_id}&$version={version}"
            ),
            None => format!("$iothub/twin/PATCH/properties/reported/?$rid={request_id}"),
        }
    }

    /// Parsed `$iothub/twin/res/{status}/?$rid=..&$version=..`
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TwinResponseTopic {
        pub status: u16,
        pub request_id: String,
        pub version: Option<i64>,
    }

    pub fn parse_twin_response(topic: &str) -> Option<TwinResponseTopic> {
        let rest = topic.strip_prefix(TWIN_RESPONSE_PREFIX)?;
        let (status, query) = rest.split_once("/?")?;
        let status = status.parse().ok()?;

        let mut request_id = None;
        let mut version = None;
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "$rid" => request_id = Some(value.into_owned()),
                "$version" => version = value.parse().ok(),
                _ => {}
            }
        }

        Some(TwinResponseTopic {
            status,
            request_id: request_id?,
            version,
        })
    }

    /// Version carried on a desired-properties PATCH topic, if any
    pub fn desired_patch_version(topic: &str) -> Option<i64> {
        let rest = topic.strip_prefix(TWIN_DESIRED_PREFIX)?;
        let query = rest.strip_prefix('?')?;
        form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "$version")
            .and_then(|(_, value)| value.parse().ok())
    }

    /// Decode the property bag at the end of a devicebound topic
    pub fn parse_property_bag(encoded: &str) -> Vec<(String, String)> {
        form_urlencoded::parse(encoded.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }
}

/// Map an upstream status code to a result
///
/// `payload_size` and `limit` only feed the `MessageTooLarge` error for 413.
pub fn status_to_result(
    status: u16,
    identity: &Identity,
    context: &str,
    payload_size: usize,
    limit: usize,
) -> HubResult<()> {
    match status {
        200..=299 => Ok(()),
        400 => Err(HubError::invalid_argument(format!(
            "{context} rejected as malformed (400)"
        ))),
        401 | 403 => Err(HubError::unauthorized(
            identity,
            format!("{context} rejected with status {status}"),
        )),
        404 => Err(HubError::NotFound(format!("{context} for {identity}"))),
        412 => Err(HubError::version_conflict(format!(
            "{context} for {identity} used a stale version"
        ))),
        413 => Err(HubError::MessageTooLarge {
            size: payload_size,
            limit,
        }),
        429 => Err(HubError::Throttled),
        500..=599 => Err(HubError::link_down(format!(
            "{context} failed with status {status}"
        ))),
        other => Err(HubError::internal_error(format!(
            "{context} returned unexpected status {other}"
        ))),
    }
}

fn map_connack(code: ConnectReturnCode, identity: &Identity) -> HubError {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            HubError::unauthorized(identity, format!("upstream refused connection: {code:?}"))
        }
        other => HubError::link_down(format!("upstream refused connection: {other:?}")),
    }
}

/// Build MQTT options for an identity (pure)
pub fn configure_mqtt_options(
    hostname: &str,
    port: u16,
    use_tls: bool,
    identity: &Identity,
    credentials: &Credentials,
) -> HubResult<MqttOptions> {
    let token = match &credentials.auth {
        AuthMethod::SasToken { token } => token.clone(),
        AuthMethod::X509 { .. } => {
            return Err(HubError::unsupported(
                identity,
                "x509 authentication over the MQTT upstream",
            ))
        }
    };

    let mut options = MqttOptions::new(topics::client_id(identity), hostname, port);
    options.set_credentials(
        topics::username(hostname, identity, credentials.product_info.as_deref()),
        token,
    );
    options.set_keep_alive(Duration::from_secs(60));
    options.set_clean_session(false);
    if use_tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    Ok(options)
}

/// `UpstreamTransport` over IoT Hub MQTT
#[derive(Debug, Clone)]
pub struct MqttUpstream {
    hostname: String,
    port: u16,
    use_tls: bool,
    max_message_size: usize,
}

impl MqttUpstream {
    pub fn new<S: Into<String>>(hostname: S, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            use_tls: true,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn from_config(config: &HubConfig) -> Self {
        Self::new(config.hub.iothub_hostname.clone(), config.upstream.port)
            .with_max_message_size(config.upstream.max_message_size_bytes)
    }

    pub fn with_max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = limit;
        self
    }

    /// Plain TCP, for local test brokers
    pub fn without_tls(mut self) -> Self {
        self.use_tls = false;
        self
    }

    async fn await_connack(event_loop: &mut EventLoop, identity: &Identity) -> HubResult<()> {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return match ack.code {
                        ConnectReturnCode::Success => Ok(()),
                        code => Err(map_connack(code, identity)),
                    };
                }
                Ok(_) => continue,
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(map_connack(code, identity))
                }
                Err(e) => return Err(HubError::link_down(format!("connect failed: {e}"))),
            }
        }
    }
}

#[async_trait]
impl UpstreamTransport for MqttUpstream {
    async fn connect(
        &self,
        identity: &Identity,
        credentials: &Credentials,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> HubResult<Arc<dyn UpstreamSession>> {
        let options =
            configure_mqtt_options(&self.hostname, self.port, self.use_tls, identity, credentials)?;
        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        Self::await_connack(&mut event_loop, identity).await?;
        info!(%identity, host = %self.hostname, "MQTT upstream connected");

        let mut filters = vec![
            topics::TWIN_RESPONSE_FILTER.to_string(),
            topics::TWIN_DESIRED_FILTER.to_string(),
        ];
        if !identity.is_module() {
            filters.push(topics::cloud_to_device_filter(identity.device_id()));
        }
        for filter in &filters {
            client
                .subscribe(filter.as_str(), QoS::AtLeastOnce)
                .await
                .map_err(|e| HubError::link_down(format!("subscribe {filter} failed: {e}")))?;
        }

        let shared = Arc::new(SessionShared::default());
        let task = tokio::spawn(run_event_loop(
            identity.clone(),
            event_loop,
            Arc::clone(&shared),
            events,
        ));

        Ok(Arc::new(MqttSession {
            identity: identity.clone(),
            client,
            shared,
            next_request_id: AtomicU64::new(1),
            event_task: Mutex::new(Some(task)),
            max_message_size: self.max_message_size,
        }))
    }
}

type AckSender = oneshot::Sender<HubResult<()>>;

struct TwinResponse {
    status: u16,
    version: Option<i64>,
    body: bytes::Bytes,
}

#[derive(Default)]
struct SessionShared {
    /// One slot per publish, in request order; `None` for QoS 0
    publish_order: Mutex<VecDeque<Option<AckSender>>>,
    awaiting_ack: Mutex<HashMap<u16, AckSender>>,
    twin_requests: Mutex<HashMap<String, oneshot::Sender<TwinResponse>>>,
    closed: AtomicBool,
}

impl SessionShared {
    /// Drop every pending waiter so callers see the link go down
    fn fail_pending(&self) {
        if let Ok(mut order) = self.publish_order.lock() {
            order.clear();
        }
        if let Ok(mut acks) = self.awaiting_ack.lock() {
            acks.clear();
        }
        if let Ok(mut requests) = self.twin_requests.lock() {
            requests.clear();
        }
    }
}

async fn run_event_loop(
    identity: Identity,
    mut event_loop: EventLoop,
    shared: Arc<SessionShared>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let slot = shared
                    .publish_order
                    .lock()
                    .ok()
                    .and_then(|mut order| order.pop_front());
                if let Some(Some(sender)) = slot {
                    if let Ok(mut acks) = shared.awaiting_ack.lock() {
                        acks.insert(pkid, sender);
                    }
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                let sender = shared
                    .awaiting_ack
                    .lock()
                    .ok()
                    .and_then(|mut acks| acks.remove(&ack.pkid));
                if let Some(sender) = sender {
                    let _ = sender.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                handle_publish(&identity, &shared, &events, publish);
            }
            Ok(_) => {}
            Err(e) => {
                shared.fail_pending();
                if !shared.closed.load(Ordering::Acquire) {
                    warn!(%identity, error = %e, "MQTT upstream event loop failed");
                    let _ = events.send(SessionEvent::Disconnected(e.to_string()));
                }
                break;
            }
        }
    }
    debug!(%identity, "MQTT upstream event loop stopped");
}

fn handle_publish(
    identity: &Identity,
    shared: &SessionShared,
    events: &mpsc::UnboundedSender<SessionEvent>,
    publish: Publish,
) {
    let topic = publish.topic.as_str();

    if let Some(response) = topics::parse_twin_response(topic) {
        let waiter = shared
            .twin_requests
            .lock()
            .ok()
            .and_then(|mut requests| requests.remove(&response.request_id));
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(TwinResponse {
                    status: response.status,
                    version: response.version,
                    body: publish.payload,
                });
            }
            None => debug!(%identity, rid = %response.request_id, "Unmatched twin response"),
        }
        return;
    }

    if topic.starts_with(topics::TWIN_DESIRED_PREFIX) {
        match TwinPatch::from_slice(&publish.payload) {
            Ok(patch) => {
                let patch = match (patch.version(), topics::desired_patch_version(topic)) {
                    (None, Some(version)) => patch.with_version(version),
                    _ => patch,
                };
                let _ = events.send(SessionEvent::DesiredPropertiesUpdated(patch));
            }
            Err(e) => warn!(%identity, error = %e, "Ignoring malformed desired patch"),
        }
        return;
    }

    if let Some(bag) = topic.strip_prefix(&topics::cloud_to_device_prefix(identity.device_id())) {
        let message = cloud_to_device_message(identity, bag, publish.payload);
        let _ = events.send(SessionEvent::CloudToDevice(message));
        return;
    }

    debug!(%identity, topic, "Ignoring publish on unexpected topic");
}

fn cloud_to_device_message(identity: &Identity, bag: &str, payload: bytes::Bytes) -> Message {
    let mut system = SystemProperties::default();
    let mut properties = HashMap::new();
    for (key, value) in topics::parse_property_bag(bag) {
        match key.as_str() {
            topics::PROP_MESSAGE_ID => system.message_id = Some(value),
            topics::PROP_CORRELATION_ID => system.correlation_id = Some(value),
            topics::PROP_CONTENT_TYPE => system.content_type = Some(value),
            topics::PROP_CONTENT_ENCODING => system.content_encoding = Some(value),
            _ if key.starts_with("$.") || key.starts_with("iothub-") => {}
            _ => {
                properties.insert(key, value);
            }
        }
    }

    Message::builder(identity.clone(), payload)
        .system_properties(system)
        .properties(properties)
        .build()
}

struct MqttSession {
    identity: Identity,
    client: AsyncClient,
    shared: Arc<SessionShared>,
    next_request_id: AtomicU64,
    event_task: Mutex<Option<JoinHandle<()>>>,
    max_message_size: usize,
}

impl MqttSession {
    fn check_size(&self, size: usize) -> HubResult<()> {
        if size > self.max_message_size {
            return Err(HubError::MessageTooLarge {
                size,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }

    fn publish(
        &self,
        topic: String,
        qos: QoS,
        payload: Vec<u8>,
    ) -> HubResult<Option<oneshot::Receiver<HubResult<()>>>> {
        let (sender, receiver) = match qos {
            QoS::AtMostOnce => (None, None),
            _ => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
        };

        // The slot must be queued in the same order the event loop sees the publish
        let mut order = self
            .shared
            .publish_order
            .lock()
            .map_err(|_| HubError::internal_error("publish order lock poisoned"))?;
        self.client
            .try_publish(topic, qos, false, payload)
            .map_err(|e| HubError::link_down(format!("publish failed: {e}")))?;
        order.push_back(sender);
        Ok(receiver)
    }

    async fn twin_request(
        &self,
        topic_for: impl FnOnce(&str) -> String + Send,
        payload: Vec<u8>,
    ) -> HubResult<TwinResponse> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        self.shared
            .twin_requests
            .lock()
            .map_err(|_| HubError::internal_error("twin request lock poisoned"))?
            .insert(request_id.clone(), tx);

        if let Err(e) = self.publish(topic_for(&request_id), QoS::AtMostOnce, payload) {
            if let Ok(mut requests) = self.shared.twin_requests.lock() {
                requests.remove(&request_id);
            }
            return Err(e);
        }

        rx.await
            .map_err(|_| HubError::link_down("link dropped before twin response"))
    }
}

#[async_trait]
impl UpstreamSession for MqttSession {
    async fn send(&self, message: &Message) -> HubResult<()> {
        self.check_size(message.payload().len())?;
        let topic = topics::telemetry_topic(&self.identity, message);
        let receiver = self.publish(topic, QoS::AtLeastOnce, message.payload().to_vec())?;
        match receiver {
            Some(receiver) => receiver
                .await
                .map_err(|_| HubError::link_down("link dropped before PUBACK"))?,
            None => Ok(()),
        }
    }

    async fn get_twin(&self) -> HubResult<TwinDocument> {
        let response = self.twin_request(topics::twin_get_topic, Vec::new()).await?;
        status_to_result(response.status, &self.identity, "twin GET", 0, self.max_message_size)?;
        Ok(serde_json::from_slice(&response.body)?)
    }

    async fn update_reported(
        &self,
        patch: &TwinPatch,
        base_version: Option<i64>,
    ) -> HubResult<i64> {
        let payload = patch.to_bytes()?;
        let payload_size = payload.len();
        self.check_size(payload_size)?;
        let response = self
            .twin_request(
                |rid| topics::twin_reported_topic(rid, base_version),
                payload,
            )
            .await?;
        status_to_result(
            response.status,
            &self.identity,
            "reported properties PATCH",
            payload_size,
            self.max_message_size,
        )?;
        response.version.ok_or_else(|| {
            HubError::internal_error("reported properties response carried no $version")
        })
    }

    async fn complete(&self, _message_id: &str) -> HubResult<()> {
        // Devicebound publishes are acknowledged by PUBACK on receipt
        Ok(())
    }

    async fn abandon(&self, _message_id: &str) -> HubResult<()> {
        Err(HubError::unsupported(&self.identity, "abandon over MQTT"))
    }

    async fn reject(&self, _message_id: &str) -> HubResult<()> {
        Err(HubError::unsupported(&self.identity, "reject over MQTT"))
    }

    async fn close(&self) -> HubResult<()> {
        self.shared.closed.store(true, Ordering::Release);
        if let Err(e) = self.client.try_disconnect() {
            debug!(identity = %self.identity, error = %e, "MQTT disconnect request failed");
        }
        let task = self.event_task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            // Give the DISCONNECT packet a moment to flush
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                debug!(identity = %self.identity, "MQTT event loop did not stop in time");
            }
        }
        self.shared.fail_pending();
        Ok(())
    }
}
