//! Portico application-server core.
//!
//! The runtime that multiplexes mounted sub-applications behind one
//! listener: a hierarchical route tree with metadata-driven resolution, an
//! ordered middleware pipeline terminating in the dispatcher, a
//! transport-agnostic request/response model, and the lifespan manager
//! binding the execution subsystem to server startup and shutdown.
//!
//! Protocol bindings live elsewhere (`portico-http` owns axum); this crate
//! only speaks the channel-based transport contract in [`transport`].

pub mod args;
pub mod auth;
pub mod authexpr;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod lifespan;
pub mod middleware;
pub mod middlewares;
pub mod prelude;
pub mod registry;
pub mod request;
pub mod response;
pub mod router;
pub mod routes;
pub mod server;
pub mod session;
pub mod transport;

pub use args::{bind_args, ArgKind, ArgSpec, BoundArgs};
pub use auth::{AuthBackend, JwtAuthBackend};
pub use authexpr::AuthExpr;
pub use config::{Config, ConfigError, ServerSettings};
pub use dispatcher::{Dispatcher, WsConnectionHandler};
pub use error::ServerError;
pub use lifespan::LifespanManager;
pub use middleware::{Middleware, MiddlewarePipeline, MwFuture, Next, ServerCall, Terminal};
pub use registry::{current_request, with_current_request, RequestRegistry};
pub use request::{BodyLimits, Request, RequestHandle};
pub use response::{ByteStream, Metadata, Payload, Response};
pub use router::{
    Decision, IntrospectionMode, Resolved, ResolveContext, RouteNode, Router, RouterPlugin,
};
pub use routes::{Handler, HandlerCall, Outcome, Route, RouteSet, RoutingInstance};
pub use server::{AppFactory, AppInstance, Server, ServerBuilder, RESERVED_PREFIX};
pub use session::{InMemorySessionStore, SessionStore};
pub use transport::{
    channel_pair, AuthRecord, ReceiveEvent, Scope, ScopeKind, SendEvent, TransportKind,
    TransportSender, WsPayload,
};
