//! Upstream cloud link
//!
//! [`UpstreamTransport`] and [`UpstreamSession`] are the seam to the wire
//! protocol. [`CloudProxy`] wraps one session per identity and adds reconnect,
//! timeouts, size checks and exactly-once close on top of it.

pub mod mqtt;
pub mod proxy;
pub mod retry;

pub use mqtt::MqttUpstream;
pub use proxy::{CloudConnectionState, CloudProxy, CloudProxyConfig};
pub use retry::{RetryDecision, RetryPolicy};

use crate::error::{HubError, HubResult};
use crate::identity::{Credentials, Identity};
use crate::message::Message;
use crate::twin::{TwinDocument, TwinPatch};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events pushed by an upstream session outside of request/response calls
#[derive(Debug, Clone)]
pub enum SessionEvent {
    DesiredPropertiesUpdated(TwinPatch),
    CloudToDevice(Message),
    /// The link dropped; the session is unusable from here on
    Disconnected(String),
}

/// Dials upstream sessions
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Open a session for `identity`
    ///
    /// Unsolicited traffic for the session is delivered on `events`.
    async fn connect(
        &self,
        identity: &Identity,
        credentials: &Credentials,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> HubResult<Arc<dyn UpstreamSession>>;
}

/// One established upstream session
#[async_trait]
pub trait UpstreamSession: Send + Sync {
    async fn send(&self, message: &Message) -> HubResult<()>;

    /// Whether `send_batch` is a real batch operation for this session
    fn supports_batch(&self) -> bool {
        false
    }

    async fn send_batch(&self, messages: &[Message]) -> HubResult<()> {
        for message in messages {
            self.send(message).await?;
        }
        Ok(())
    }

    async fn get_twin(&self) -> HubResult<TwinDocument>;

    /// Submit reported properties, returning the new reported version
    async fn update_reported(&self, patch: &TwinPatch, base_version: Option<i64>)
        -> HubResult<i64>;

    async fn complete(&self, message_id: &str) -> HubResult<()>;

    async fn abandon(&self, message_id: &str) -> HubResult<()> {
        Err(HubError::NotFound(format!(
            "no pending cloud message {message_id}"
        )))
    }

    async fn reject(&self, message_id: &str) -> HubResult<()> {
        Err(HubError::NotFound(format!(
            "no pending cloud message {message_id}"
        )))
    }

    async fn close(&self) -> HubResult<()>;
}
