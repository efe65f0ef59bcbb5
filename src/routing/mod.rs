//! Message routing
//!
//! ## Routes (route.rs, condition.rs)
//!
//! Routes are declared in configuration as
//! `FROM <source> [WHERE <condition>] INTO <endpoint>, ...` and parsed once
//! into an immutable [`RouteTable`]. Reloading parses a whole new table and
//! swaps it in; a table is never edited in place.
//!
//! ## Endpoints (endpoint.rs)
//!
//! `$upstream`, `BrokeredEndpoint("/modules/<m>/inputs/<i>")` and `$<name>`
//! system endpoints, all behind one `accept` call.
//!
//! ## Router (router.rs)
//!
//! Direct delivery with throttle backoff, store-and-forward on failure, and
//! per-queue drain tasks.

pub mod condition;
pub mod endpoint;
pub mod route;
pub mod router;

pub use condition::{Condition, ConditionError};
pub use endpoint::{Endpoint, EndpointId, EndpointResolver, SystemHandler};
pub use route::{Route, RouteMatch, RouteSource, RouteTable};
pub use router::{
    delivery_action, DeliveryAction, DeliveryStatus, DestinationOutcome, Router, RouterConfig,
    RoutingOutcome,
};
