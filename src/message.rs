//! Immutable message envelope
//!
//! Messages are value objects. Routing never mutates one in place; when a
//! destination needs different properties (an input name, a trace stamp) a
//! modified copy is produced with the `with_*` methods.

use crate::identity::Identity;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// System property names as they appear in route conditions
pub mod system_property {
    pub const MESSAGE_ID: &str = "messageId";
    pub const CORRELATION_ID: &str = "correlationId";
    pub const CONTENT_TYPE: &str = "contentType";
    pub const CONTENT_ENCODING: &str = "contentEncoding";
    pub const CONNECTION_DEVICE_ID: &str = "connectionDeviceId";
    pub const CONNECTION_MODULE_ID: &str = "connectionModuleId";
    pub const OUTPUT_NAME: &str = "outputName";
    pub const INPUT_NAME: &str = "inputName";
}

/// Broker-defined properties carried next to the application properties
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// Sender asked for a delivery acknowledgement
    #[serde(default)]
    pub ack_requested: bool,
    /// Module output the message was sent on
    pub output_name: Option<String>,
    /// Module input the message is delivered to
    pub input_name: Option<String>,
}

/// A message flowing through the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    payload: Bytes,
    system_properties: SystemProperties,
    properties: HashMap<String, String>,
    enqueued_time: DateTime<Utc>,
    origin: Identity,
}

impl Message {
    pub fn builder<P: Into<Bytes>>(origin: Identity, payload: P) -> MessageBuilder {
        MessageBuilder {
            payload: payload.into(),
            system_properties: SystemProperties::default(),
            properties: HashMap::new(),
            origin,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn size(&self) -> usize {
        let properties: usize = self
            .properties
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        self.payload.len() + properties
    }

    pub fn system_properties(&self) -> &SystemProperties {
        &self.system_properties
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.system_properties.message_id.as_deref()
    }

    pub fn enqueued_time(&self) -> DateTime<Utc> {
        self.enqueued_time
    }

    pub fn origin(&self) -> &Identity {
        &self.origin
    }

    /// Resolve a system property by its route-condition name (without the `$`)
    pub fn system_property(&self, name: &str) -> Option<&str> {
        use system_property::*;
        let sp = &self.system_properties;
        match name {
            MESSAGE_ID => sp.message_id.as_deref(),
            CORRELATION_ID => sp.correlation_id.as_deref(),
            CONTENT_TYPE => sp.content_type.as_deref(),
            CONTENT_ENCODING => sp.content_encoding.as_deref(),
            CONNECTION_DEVICE_ID => Some(self.origin.device_id()),
            CONNECTION_MODULE_ID => self.origin.module_id(),
            OUTPUT_NAME => sp.output_name.as_deref(),
            INPUT_NAME => sp.input_name.as_deref(),
            _ => None,
        }
    }

    /// Copy with one application property added or replaced
    pub fn with_property<K: Into<String>, V: Into<String>>(&self, key: K, value: V) -> Self {
        let mut copy = self.clone();
        copy.properties.insert(key.into(), value.into());
        copy
    }

    /// Copy addressed to a module input
    pub fn with_input_name<S: Into<String>>(&self, input_name: S) -> Self {
        let mut copy = self.clone();
        copy.system_properties.input_name = Some(input_name.into());
        copy
    }
}

/// Builder for [`Message`]
#[derive(Debug)]
pub struct MessageBuilder {
    payload: Bytes,
    system_properties: SystemProperties,
    properties: HashMap<String, String>,
    origin: Identity,
}

impl MessageBuilder {
    pub fn message_id<S: Into<String>>(mut self, id: S) -> Self {
        self.system_properties.message_id = Some(id.into());
        self
    }

    pub fn correlation_id<S: Into<String>>(mut self, id: S) -> Self {
        self.system_properties.correlation_id = Some(id.into());
        self
    }

    pub fn content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.system_properties.content_type = Some(content_type.into());
        self
    }

    pub fn content_encoding<S: Into<String>>(mut self, encoding: S) -> Self {
        self.system_properties.content_encoding = Some(encoding.into());
        self
    }

    pub fn ack_requested(mut self, ack: bool) -> Self {
        self.system_properties.ack_requested = ack;
        self
    }

    pub fn output_name<S: Into<String>>(mut self, output: S) -> Self {
        self.system_properties.output_name = Some(output.into());
        self
    }

    pub fn system_properties(mut self, system_properties: SystemProperties) -> Self {
        self.system_properties = system_properties;
        self
    }

    pub fn property<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn properties(mut self, properties: HashMap<String, String>) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn build(self) -> Message {
        Message {
            payload: self.payload,
            system_properties: self.system_properties,
            properties: self.properties,
            enqueued_time: Utc::now(),
            origin: self.origin,
        }
    }
}
