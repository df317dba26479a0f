//! Convenience re-exports for application authors.

pub use crate::args::{ArgKind, ArgSpec, BoundArgs};
pub use crate::config::Config;
pub use crate::error::ServerError;
pub use crate::registry::current_request;
pub use crate::response::{Metadata, Payload};
pub use crate::routes::{Handler, HandlerCall, Outcome, Route, RouteSet, RoutingInstance};
pub use crate::server::{AppInstance, Server, ServerBuilder};
pub use portico_codec::TypedValue;
