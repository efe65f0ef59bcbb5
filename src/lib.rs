//! edgehub - edge gateway core
//!
//! Terminates many downstream device and module sessions, multiplexes them
//! onto one upstream cloud link per identity, routes messages with
//! declarative rules and stores them while a destination is unreachable.
//!
//! # Overview
//!
//! - [`connection::ConnectionManager`]: one logical connection and one
//!   upstream proxy per identity, with single-flight dialing
//! - [`cloud::CloudProxy`]: upstream link with reconnect and backoff
//! - [`routing::Router`]: route evaluation, fan-out and drain tasks
//! - [`store::MessageStore`]: bounded per-endpoint FIFO queues
//! - [`twin::TwinManager`]: desired and reported property reconciliation
//! - [`hub::Hub`]: wires everything together for a transport adapter
//!
//! # Quick Start
//!
//! ```rust
//! use edgehub::identity::Identity;
//! use edgehub::message::Message;
//! use edgehub::routing::{EndpointId, RouteTable};
//!
//! let routes = RouteTable::parse([
//!     ("alerts", "FROM /messages/modules/sensor/outputs/* WHERE level > 3 INTO $upstream"),
//!     ("filter", "FROM /messages/modules/sensor/* INTO BrokeredEndpoint(\"/modules/filter/inputs/in1\")"),
//! ])
//! .unwrap();
//!
//! let message = Message::builder(Identity::module("edge-1", "sensor"), "{\"t\": 21}")
//!     .output_name("telemetry")
//!     .property("level", "5")
//!     .build();
//!
//! let matched = routes.destinations(&message);
//! assert_eq!(
//!     matched.endpoints,
//!     vec![EndpointId::Upstream, EndpointId::module_input("filter", "in1")]
//! );
//! ```

pub mod cloud;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod hub;
pub mod identity;
pub mod message;
pub mod observability;
pub mod routing;
pub mod store;
pub mod testing;
pub mod twin;

pub use config::HubConfig;
pub use device::{DeviceListener, Disposition};
pub use error::{ErrorKind, HubError, HubResult};
pub use hub::Hub;
pub use identity::{Credentials, Identity};
pub use message::Message;
