//! Route declaration: handlers, route definitions, and the builder that
//! routing instances use to contribute a subtree.
//!
//! There is no attribute scanning; an instance declares its handler table
//! explicitly at construction, mapping names to functions plus metadata.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::args::{ArgSpec, BoundArgs};
use crate::error::ServerError;
use crate::request::RequestHandle;
use crate::response::{Metadata, Payload};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Everything a handler receives for one invocation.
pub struct HandlerCall {
    pub request: RequestHandle,
    pub args: BoundArgs,
}

/// A handler's return: a bare value, or a value with per-call metadata
/// that the dispatcher merges on top of the node metadata.
pub struct Outcome {
    pub payload: Payload,
    pub metadata: Option<Metadata>,
}

impl Outcome {
    /// A bare value.
    pub fn value(payload: impl Into<Payload>) -> Outcome {
        Outcome {
            payload: payload.into(),
            metadata: None,
        }
    }

    /// A value with a per-call metadata override.
    pub fn with_metadata(payload: impl Into<Payload>, metadata: Metadata) -> Outcome {
        Outcome {
            payload: payload.into(),
            metadata: Some(metadata),
        }
    }
}

type AsyncHandlerFn =
    dyn Fn(HandlerCall) -> BoxFuture<Result<Outcome, ServerError>> + Send + Sync;
type BlockingHandlerFn = dyn Fn(HandlerCall) -> Result<Outcome, ServerError> + Send + Sync;

/// A callable route target with its declared calling convention.
///
/// Async handlers run cooperatively on the request task; blocking handlers
/// never run there, the dispatcher moves them to the blocking pool.
#[derive(Clone)]
pub enum Handler {
    Async(Arc<AsyncHandlerFn>),
    Blocking(Arc<BlockingHandlerFn>),
}

impl Handler {
    /// Wrap an async handler function.
    pub fn asynchronous<F, Fut>(f: F) -> Handler
    where
        F: Fn(HandlerCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Outcome, ServerError>> + Send + 'static,
    {
        Handler::Async(Arc::new(move |call| Box::pin(f(call))))
    }

    /// Wrap a synchronous handler; it will be offloaded to the blocking pool.
    pub fn blocking<F>(f: F) -> Handler
    where
        F: Fn(HandlerCall) -> Result<Outcome, ServerError> + Send + Sync + 'static,
    {
        Handler::Blocking(Arc::new(f))
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, Handler::Blocking(_))
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Async(_) => f.write_str("Handler::Async"),
            Handler::Blocking(_) => f.write_str("Handler::Blocking"),
        }
    }
}

/// One declared route: a named node with an optional handler, metadata,
/// an argument schema, and children.
#[derive(Debug)]
pub struct Route {
    pub name: String,
    pub handler: Option<Handler>,
    pub metadata: Metadata,
    pub arg_schema: Vec<ArgSpec>,
    pub children: Vec<Route>,
}

impl Route {
    /// A leaf route with a handler.
    pub fn handler(name: &str, handler: Handler) -> Route {
        Route {
            name: name.to_string(),
            handler: Some(handler),
            metadata: Metadata::new(),
            arg_schema: Vec::new(),
            children: Vec::new(),
        }
    }

    /// A grouping node without a handler of its own.
    pub fn subtree(name: &str) -> Route {
        Route {
            name: name.to_string(),
            handler: None,
            metadata: Metadata::new(),
            arg_schema: Vec::new(),
            children: Vec::new(),
        }
    }

    /// A parameterized child: `Route::param("name", ...)` matches any one
    /// segment and binds it to the slot `name`.
    pub fn param(slot: &str, handler: Handler) -> Route {
        Route::handler(&format!(":{slot}"), handler)
    }

    pub fn arg(mut self, spec: ArgSpec) -> Route {
        self.arg_schema.push(spec);
        self
    }

    pub fn metadata(mut self, key: &str, value: serde_json::Value) -> Route {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Sugar for the `auth_tags` metadata entry.
    pub fn auth_tags(self, expression: &str) -> Route {
        self.metadata("auth_tags", serde_json::Value::String(expression.to_string()))
    }

    /// Sugar for the `required_capabilities` metadata entry.
    pub fn capabilities(self, caps: &[&str]) -> Route {
        self.metadata(
            "required_capabilities",
            serde_json::Value::Array(
                caps.iter().map(|c| serde_json::json!(c)).collect(),
            ),
        )
    }

    pub fn child(mut self, route: Route) -> Route {
        self.children.push(route);
        self
    }
}

/// The set of routes a routing instance contributes when attached.
#[derive(Debug, Default)]
pub struct RouteSet {
    pub routes: Vec<Route>,
    /// Metadata applied to the attachment node itself (and therefore
    /// inherited by the whole subtree).
    pub metadata: Metadata,
}

impl RouteSet {
    pub fn new() -> RouteSet {
        RouteSet::default()
    }

    pub fn route(mut self, route: Route) -> RouteSet {
        self.routes.push(route);
        self
    }

    pub fn metadata(mut self, key: &str, value: serde_json::Value) -> RouteSet {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// An object that contributes a subtree when attached to a route node.
pub trait RoutingInstance: Send + Sync + 'static {
    fn routes(&self) -> RouteSet;
}
