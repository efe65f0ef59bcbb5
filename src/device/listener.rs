//! Per-session entry point for transport adapters
//!
//! A [`DeviceListener`] is handed to the transport when a session
//! authenticates. Inbound messages go through it to the router, and the
//! session's lifecycle follows the shared connection state machine.

use crate::connection::{next_state, Connection, ConnectionManager, ConnectionState, ConnectionTrigger};
use crate::error::{ErrorKind, HubError, HubResult};
use crate::identity::Identity;
use crate::message::{system_property, Message, SystemProperties};
use crate::routing::Router;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How the transport should acknowledge an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Routed (delivered, stored or unmatched)
    Accepted,
    /// Will never succeed; do not resend
    Rejected,
    /// Temporarily refused; the sender may resend
    Abandoned,
}

impl Disposition {
    pub fn for_error(error: &HubError) -> Self {
        match error.kind() {
            ErrorKind::Configuration | ErrorKind::Fatal => Disposition::Rejected,
            ErrorKind::Transient | ErrorKind::Capacity => Disposition::Abandoned,
        }
    }
}

pub struct DeviceListener {
    identity: Identity,
    connection_id: u64,
    state: Mutex<ConnectionState>,
    router: Arc<Router>,
    connections: Arc<ConnectionManager>,
    /// Cancels routes still in flight when the session goes away
    in_flight: CancellationToken,
}

impl DeviceListener {
    pub fn new(connection: &Connection, router: Arc<Router>, connections: Arc<ConnectionManager>) -> Self {
        Self {
            identity: connection.identity().clone(),
            connection_id: connection.id(),
            state: Mutex::new(connection.state()),
            router,
            connections,
            in_flight: CancellationToken::new(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ConnectionState::Closed)
    }

    /// Apply a lifecycle trigger; returns the new state if it was allowed
    pub fn apply(&self, trigger: ConnectionTrigger) -> Option<ConnectionState> {
        let mut state = self.state.lock().ok()?;
        let next = next_state(*state, trigger)?;
        debug!(identity = %self.identity, from = %*state, to = %next, "Listener state changed");
        *state = next;
        Some(next)
    }

    /// Build a message from transport bytes and properties
    ///
    /// Keys starting with `$` set system properties by their route-condition
    /// name (`$messageId`, `$correlationId`, `$contentType`,
    /// `$contentEncoding`, `$outputName`); everything else is an application
    /// property. Connection ids always come from the session identity.
    pub fn build_message(&self, payload: Bytes, properties: HashMap<String, String>) -> Message {
        let mut system = SystemProperties::default();
        let mut application = HashMap::with_capacity(properties.len());

        for (key, value) in properties {
            let Some(name) = key.strip_prefix('$') else {
                application.insert(key, value);
                continue;
            };
            match name {
                system_property::MESSAGE_ID => system.message_id = Some(value),
                system_property::CORRELATION_ID => system.correlation_id = Some(value),
                system_property::CONTENT_TYPE => system.content_type = Some(value),
                system_property::CONTENT_ENCODING => system.content_encoding = Some(value),
                system_property::OUTPUT_NAME if self.identity.is_module() => {
                    system.output_name = Some(value)
                }
                _ => debug!(identity = %self.identity, property = %key, "Ignoring system property"),
            }
        }

        Message::builder(self.identity.clone(), payload)
            .system_properties(system)
            .properties(application)
            .build()
    }

    /// Route one inbound message and say how to acknowledge it
    pub async fn process_message(&self, message: Message) -> Disposition {
        if self.state() != ConnectionState::Connected {
            debug!(identity = %self.identity, state = %self.state(), "Message on inactive session rejected");
            return Disposition::Rejected;
        }
        if message.origin() != &self.identity {
            warn!(
                identity = %self.identity,
                origin = %message.origin(),
                "Message origin does not match session identity"
            );
            return Disposition::Rejected;
        }

        match self.router.route(&message, &self.in_flight).await {
            Ok(_) => Disposition::Accepted,
            Err(e) => {
                let disposition = Disposition::for_error(&e);
                debug!(identity = %self.identity, error = %e, ?disposition, "Routing failed");
                disposition
            }
        }
    }

    /// Settle a cloud-to-device message as delivered
    pub async fn complete(&self, message_id: &str) -> HubResult<()> {
        self.upstream_disposition(message_id, Settle::Complete).await
    }

    /// Return a cloud-to-device message for redelivery
    pub async fn abandon(&self, message_id: &str) -> HubResult<()> {
        self.upstream_disposition(message_id, Settle::Abandon).await
    }

    /// Dead-letter a cloud-to-device message; devices only
    pub async fn reject(&self, message_id: &str) -> HubResult<()> {
        if self.identity.is_module() {
            return Err(HubError::unsupported(&self.identity, "reject"));
        }
        self.upstream_disposition(message_id, Settle::Reject).await
    }

    async fn upstream_disposition(&self, message_id: &str, settle: Settle) -> HubResult<()> {
        let proxy = self
            .connections
            .cloud_proxy(&self.identity)
            .await
            .ok_or_else(|| HubError::link_down(format!("no upstream link for {}", self.identity)))?;
        match settle {
            Settle::Complete => proxy.complete(message_id).await,
            Settle::Abandon => proxy.abandon(message_id).await,
            Settle::Reject => proxy.reject(message_id).await,
        }
    }

    /// The transport session went away
    ///
    /// Routes still in flight store their message instead of waiting, and the
    /// connection enters its grace window. A listener for a superseded
    /// session does not disturb the current connection.
    pub async fn disconnect(&self) -> HubResult<()> {
        if self.apply(ConnectionTrigger::TransportLost).is_none() {
            return Ok(());
        }
        self.in_flight.cancel();
        self.connections
            .disconnect_connection(&self.identity, Some(self.connection_id))
            .await
    }
}

impl fmt::Debug for DeviceListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceListener")
            .field("identity", &self.identity)
            .field("connection_id", &self.connection_id)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum Settle {
    Complete,
    Abandon,
    Reject,
}
