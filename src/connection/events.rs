//! Hub-wide notification bus
//!
//! Components never call each other to report connectivity. They publish a
//! [`HubEvent`] and whoever cares (router drains, twin manager, connection
//! manager) subscribes.

use crate::cloud::CloudConnectionState;
use crate::identity::Identity;
use crate::message::Message;
use crate::twin::TwinPatch;
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum HubEvent {
    /// Upstream link state changed for an identity
    CloudConnectivity {
        identity: Identity,
        state: CloudConnectionState,
    },
    /// Downstream device or module connected or went away
    DeviceConnectivity { identity: Identity, connected: bool },
    /// Desired properties arrived from the cloud
    DesiredPropertiesUpdated { identity: Identity, patch: TwinPatch },
    /// Cloud-to-device message for a device identity
    CloudToDevice { identity: Identity, message: Message },
    /// The identity's connection and upstream proxy were removed for good
    ConnectionRemoved { identity: Identity },
}

impl HubEvent {
    pub fn identity(&self) -> &Identity {
        match self {
            HubEvent::CloudConnectivity { identity, .. }
            | HubEvent::DeviceConnectivity { identity, .. }
            | HubEvent::DesiredPropertiesUpdated { identity, .. }
            | HubEvent::CloudToDevice { identity, .. }
            | HubEvent::ConnectionRemoved { identity } => identity,
        }
    }

    /// True when this event makes the upstream reachable for its identity
    pub fn is_cloud_connected(&self) -> bool {
        matches!(
            self,
            HubEvent::CloudConnectivity {
                state: CloudConnectionState::Connected,
                ..
            }
        )
    }
}

/// Broadcast channel shared by every component of one hub
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HubEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: HubEvent) {
        trace!(identity = %event.identity(), ?event, "Publishing hub event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
