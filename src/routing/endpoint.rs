//! Route destinations
//!
//! An [`EndpointId`] is the serialisable address a route names. At delivery
//! time it is resolved against the live connection registry into an
//! [`Endpoint`], which is one of three variants behind a single `accept`
//! capability.

use crate::cloud::CloudProxy;
use crate::connection::{ConnectionManager, DeviceProxy};
use crate::error::{HubError, HubResult};
use crate::identity::Identity;
use crate::message::Message;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub const UPSTREAM: &str = "$upstream";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointId {
    /// The sender's own cloud link
    Upstream,
    /// An input of a module hosted on this edge device
    ModuleInput { module_id: String, input: String },
    /// An in-process handler registered under `$name`
    System(String),
}

impl EndpointId {
    pub fn module_input<M: Into<String>, I: Into<String>>(module_id: M, input: I) -> Self {
        EndpointId::ModuleInput {
            module_id: module_id.into(),
            input: input.into(),
        }
    }

    /// Parse `/modules/<module>/inputs/<input>`
    pub fn parse_module_input(address: &str) -> Option<Self> {
        let rest = address.trim().strip_prefix("/modules/")?;
        let (module_id, input) = rest.split_once("/inputs/")?;
        let valid = |s: &str| !s.is_empty() && !s.contains('/') && !s.contains('*');
        if valid(module_id) && valid(input) {
            Some(EndpointId::module_input(module_id, input))
        } else {
            None
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointId::Upstream => f.write_str(UPSTREAM),
            EndpointId::ModuleInput { module_id, input } => {
                write!(f, "/modules/{module_id}/inputs/{input}")
            }
            EndpointId::System(name) => write!(f, "${name}"),
        }
    }
}

/// In-process consumer behind a `$name` endpoint
#[async_trait]
pub trait SystemHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> HubResult<()>;
}

/// A resolved destination, ready to accept messages
pub enum Endpoint {
    /// `None` when the sender has no cloud proxy yet
    Cloud(Option<CloudProxy>),
    Module {
        target: Identity,
        input: String,
        device: Option<Arc<dyn DeviceProxy>>,
    },
    System {
        name: String,
        handler: Arc<dyn SystemHandler>,
    },
}

impl Endpoint {
    pub async fn accept(&self, message: &Message) -> HubResult<()> {
        match self {
            Endpoint::Cloud(Some(proxy)) => proxy.send(message).await,
            Endpoint::Cloud(None) => Err(HubError::link_down(format!(
                "no upstream link for {}",
                message.origin()
            ))),
            Endpoint::Module {
                target,
                input,
                device,
            } => match device {
                Some(device) if device.is_active() => {
                    let routed = message.with_input_name(input.as_str());
                    device.send_message(&routed, input).await
                }
                _ => Err(HubError::link_down(format!("module {target} is not connected"))),
            },
            Endpoint::System { handler, .. } => handler.handle(message).await,
        }
    }

    /// Deliver a batch; only the cloud link has a native batch call
    pub async fn accept_batch(&self, messages: &[Message]) -> HubResult<()> {
        match self {
            Endpoint::Cloud(Some(proxy)) => proxy.send_batch(messages).await,
            _ => {
                for message in messages {
                    self.accept(message).await?;
                }
                Ok(())
            }
        }
    }

    pub fn supports_batch(&self) -> bool {
        matches!(self, Endpoint::Cloud(Some(_)))
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Cloud(proxy) => f
                .debug_struct("Cloud")
                .field("identity", &proxy.as_ref().map(|p| p.identity().to_string()))
                .finish(),
            Endpoint::Module {
                target,
                input,
                device,
            } => f
                .debug_struct("Module")
                .field("target", target)
                .field("input", input)
                .field("connected", &device.is_some())
                .finish(),
            Endpoint::System { name, .. } => f.debug_struct("System").field("name", name).finish(),
        }
    }
}

/// Turns endpoint addresses into live endpoints
pub struct EndpointResolver {
    connections: Arc<ConnectionManager>,
    edge_device_id: String,
    system_handlers: DashMap<String, Arc<dyn SystemHandler>>,
}

impl EndpointResolver {
    pub fn new<S: Into<String>>(connections: Arc<ConnectionManager>, edge_device_id: S) -> Self {
        Self {
            connections,
            edge_device_id: edge_device_id.into(),
            system_handlers: DashMap::new(),
        }
    }

    pub fn edge_device_id(&self) -> &str {
        &self.edge_device_id
    }

    pub fn register_system_handler<S: Into<String>>(
        &self,
        name: S,
        handler: Arc<dyn SystemHandler>,
    ) {
        let name = name.into();
        debug!(endpoint = %format!("${name}"), "Registered system endpoint handler");
        self.system_handlers.insert(name, handler);
    }

    /// Identity of the module that owns a module-input endpoint
    pub fn module_identity(&self, module_id: &str) -> Identity {
        Identity::module(self.edge_device_id.as_str(), module_id)
    }

    /// Resolve `endpoint` for messages sent by `origin`
    ///
    /// Fails only for system endpoints with no registered handler. A missing
    /// cloud proxy or module connection resolves fine and fails on `accept`
    /// with `LinkDown`, so the message is stored.
    pub async fn resolve(&self, origin: &Identity, endpoint: &EndpointId) -> HubResult<Endpoint> {
        match endpoint {
            EndpointId::Upstream => Ok(Endpoint::Cloud(self.connections.cloud_proxy(origin).await)),
            EndpointId::ModuleInput { module_id, input } => {
                let target = self.module_identity(module_id);
                let device = self.connections.device_proxy(&target).await;
                Ok(Endpoint::Module {
                    target,
                    input: input.clone(),
                    device,
                })
            }
            EndpointId::System(name) => {
                let handler = self
                    .system_handlers
                    .get(name)
                    .map(|entry| Arc::clone(entry.value()))
                    .ok_or_else(|| HubError::UnknownEndpoint(endpoint.to_string()))?;
                Ok(Endpoint::System {
                    name: name.clone(),
                    handler,
                })
            }
        }
    }
}
