//! The hierarchical route tree and its resolution rules.
//!
//! The tree is assembled during server initialization by attaching routing
//! instances, then finalized; after startup it is read-only and shared
//! behind an `Arc`, so resolution takes no locks.
//!
//! Resolution walks path segments from the root. Literal children outrank
//! parameter children; when a segment matches nothing, the walk falls back
//! to the deepest catch-all `index` entry seen so far. The resolved node
//! then passes the built-in filters in fixed order (capabilities,
//! authorization, argument binding) and finally any registered plugins.

use std::collections::HashSet;
use std::sync::Arc;

use crate::args::{bind_args, ArgSpec, BoundArgs};
use crate::authexpr::AuthExpr;
use crate::error::ServerError;
use crate::request::RequestHandle;
use crate::response::Metadata;
use crate::routes::{Handler, Route, RouteSet};

/// Name of the catch-all default entry.
pub const INDEX: &str = "index";

/// Identifier of the routing instance that contributed a subtree; an index
/// into the server's instance table, used for upward inspection instead of
/// a parent pointer.
pub type OwnerId = usize;

/// A node of the route tree.
pub struct RouteNode {
    name: String,
    /// `Some(slot)` when this node binds one path segment to `slot`.
    param: Option<String>,
    handler: Option<Handler>,
    metadata: Metadata,
    arg_schema: Vec<ArgSpec>,
    children: Vec<RouteNode>,
    owner: Option<OwnerId>,

    // Computed by `finalize` from the ancestor chain.
    merged_metadata: Metadata,
    auth: Option<AuthExpr>,
    required_capabilities: Vec<String>,
}

impl RouteNode {
    fn new(name: &str, owner: Option<OwnerId>) -> RouteNode {
        let param = name.strip_prefix(':').map(str::to_string);
        RouteNode {
            name: name.to_string(),
            param,
            handler: None,
            metadata: Metadata::new(),
            arg_schema: Vec::new(),
            children: Vec::new(),
            owner,
            merged_metadata: Metadata::new(),
            auth: None,
            required_capabilities: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub fn owner(&self) -> Option<OwnerId> {
        self.owner
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Attach-time metadata mutation hook for plugins.
    pub fn set_metadata(&mut self, key: &str, value: serde_json::Value) {
        self.metadata.insert(key.to_string(), value);
    }

    fn child(&self, name: &str) -> Option<&RouteNode> {
        self.children
            .iter()
            .find(|c| c.param.is_none() && c.name == name)
    }

    fn param_child(&self) -> Option<&RouteNode> {
        self.children.iter().find(|c| c.param.is_some())
    }

    fn index_child(&self) -> Option<&RouteNode> {
        self.children
            .iter()
            .find(|c| c.name == INDEX && c.handler.is_some())
    }

    /// The `index` default also absorbs unmatched segments only when it
    /// opts in via `catch_all` metadata; a plain `index` serves the bare
    /// node path and nothing else.
    fn catch_all_child(&self) -> Option<&RouteNode> {
        self.index_child().filter(|c| {
            c.metadata
                .get("catch_all")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
        })
    }

    fn graft(&mut self, route: Route, owner: Option<OwnerId>) -> Result<(), ServerError> {
        if self.children.iter().any(|c| c.name == route.name) {
            return Err(ServerError::Internal(format!(
                "duplicate route '{}' under '{}'",
                route.name, self.name
            )));
        }
        let mut node = RouteNode::new(&route.name, owner);
        node.handler = route.handler;
        node.metadata = route.metadata;
        node.arg_schema = route.arg_schema;
        for child in route.children {
            node.graft(child, owner)?;
        }
        self.children.push(node);
        Ok(())
    }

    fn finalize(&mut self, inherited: &Metadata) -> Result<(), ServerError> {
        let mut merged = inherited.clone();
        merged.extend(self.metadata.clone());

        self.auth = match merged.get("auth_tags").and_then(|v| v.as_str()) {
            Some(expr) => AuthExpr::parse(expr)?,
            None => None,
        };
        self.required_capabilities = merged
            .get("required_capabilities")
            .and_then(|v| v.as_array())
            .map(|caps| {
                caps.iter()
                    .filter_map(|c| c.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        self.merged_metadata = merged;
        for child in &mut self.children {
            child.finalize(&self.merged_metadata)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RouteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteNode")
            .field("name", &self.name)
            .field("handler", &self.handler.is_some())
            .field("children", &self.children.len())
            .finish()
    }
}

/// A plugin's verdict during resolution.
pub enum Decision {
    Allow,
    Deny(ServerError),
}

/// Router extension invoked at attachment and during resolution.
///
/// `filter` runs after the built-in filters, in registration order, and
/// must be pure with respect to request state.
pub trait RouterPlugin: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Called once per attachment with the grafted subtree root.
    fn on_attach(&self, _node: &mut RouteNode) {}

    /// Called during resolution after the built-in filters.
    fn filter(&self, _node: &RouteNode, _request: &RequestHandle) -> Decision {
        Decision::Allow
    }
}

/// Everything resolution needs besides the path.
pub struct ResolveContext<'a> {
    pub auth_tags: &'a [String],
    pub env_capabilities: &'a [String],
    pub query: &'a [(String, String)],
    pub typed: bool,
    pub request: Option<&'a RequestHandle>,
}

impl<'a> ResolveContext<'a> {
    /// Context with only authorization inputs; used by tests and by
    /// introspection-driven callers that bind no arguments.
    pub fn bare(auth_tags: &'a [String], env_capabilities: &'a [String]) -> ResolveContext<'a> {
        ResolveContext {
            auth_tags,
            env_capabilities,
            query: &[],
            typed: false,
            request: None,
        }
    }
}

/// Successful resolution: the node's handler with bound arguments and the
/// right-biased merged metadata of the node chain.
pub struct Resolved {
    pub node_path: String,
    pub handler: Handler,
    pub bound_args: BoundArgs,
    pub metadata: Metadata,
    pub owner: Option<OwnerId>,
}

/// Introspection output shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntrospectionMode {
    Flat,
    Tree,
    OpenApi,
}

/// The route tree plus its registered plugins.
pub struct Router {
    root: RouteNode,
    plugins: Vec<Arc<dyn RouterPlugin>>,
    finalized: bool,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Router {
        Router {
            root: RouteNode::new("", None),
            plugins: Vec::new(),
            finalized: false,
        }
    }

    /// Register a plugin; order of registration is invocation order.
    pub fn register_plugin(&mut self, plugin: Arc<dyn RouterPlugin>) {
        self.plugins.push(plugin);
    }

    /// Graft an instance's routes directly under the root (the server's own
    /// handlers live here).
    pub fn attach_root(&mut self, set: RouteSet, owner: Option<OwnerId>) -> Result<(), ServerError> {
        self.root.metadata.extend(set.metadata);
        for route in set.routes {
            self.root.graft(route, owner)?;
        }
        Ok(())
    }

    /// Graft an instance's routes under a new child named `name`, recording
    /// the owning instance id on every grafted node.
    pub fn attach_instance(
        &mut self,
        name: &str,
        set: RouteSet,
        owner: OwnerId,
    ) -> Result<(), ServerError> {
        if self.root.children.iter().any(|c| c.name == name) {
            return Err(ServerError::Internal(format!(
                "an instance named '{name}' is already mounted"
            )));
        }
        let mut mount = RouteNode::new(name, Some(owner));
        mount.metadata = set.metadata;
        for route in set.routes {
            mount.graft(route, Some(owner))?;
        }
        for plugin in &self.plugins {
            plugin.on_attach(&mut mount);
        }
        self.root.children.push(mount);
        Ok(())
    }

    /// Compute effective metadata, authorization expressions, and
    /// capability requirements. Called once at the end of server startup;
    /// the tree is read-only afterwards.
    pub fn finalize(&mut self) -> Result<(), ServerError> {
        let empty = Metadata::new();
        self.root.finalize(&empty)?;
        self.finalized = true;
        Ok(())
    }

    /// Resolve a path to a handler node, applying the filter chain.
    pub fn resolve(&self, path: &str, ctx: &ResolveContext<'_>) -> Result<Resolved, ServerError> {
        if !self.finalized {
            return Err(ServerError::Internal(
                "router used before finalize".to_string(),
            ));
        }
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let mut node = &self.root;
        let mut node_path = String::new();
        let mut path_args: Vec<(String, String)> = Vec::new();
        // Deepest catch-all seen on the walk, with the segment depth at
        // which it applies.
        let mut catch_all: Option<(&RouteNode, String, usize)> = None;

        let mut depth = 0;
        for segment in segments.iter().copied() {
            if let Some(index) = node.catch_all_child() {
                catch_all = Some((index, format!("{node_path}/{INDEX}"), depth));
            }
            if let Some(child) = node.child(segment) {
                node = child;
            } else if let Some(child) = node.param_child() {
                path_args.push((
                    child.param.clone().unwrap_or_default(),
                    segment.to_string(),
                ));
                node = child;
            } else {
                return self.resolve_catch_all(catch_all, &segments, path, ctx);
            }
            node_path.push('/');
            node_path.push_str(segment);
            depth += 1;
        }

        // Path exhausted: the node itself, or its `index` default.
        if node.handler.is_none() {
            if let Some(index) = node.index_child() {
                node_path = format!("{node_path}/{INDEX}");
                node = index;
            } else {
                return Err(ServerError::NotFound(format!("no handler at '{path}'")));
            }
        }

        self.admit(node, node_path, path_args, ctx)
    }

    fn resolve_catch_all(
        &self,
        catch_all: Option<(&RouteNode, String, usize)>,
        segments: &[&str],
        path: &str,
        ctx: &ResolveContext<'_>,
    ) -> Result<Resolved, ServerError> {
        let Some((node, node_path, depth)) = catch_all else {
            return Err(ServerError::NotFound(format!("no route for '{path}'")));
        };
        // Leftover segments bind positionally against the catch-all's
        // schema, in declaration order.
        let leftover = &segments[depth..];
        let path_args: Vec<(String, String)> = node
            .arg_schema
            .iter()
            .zip(leftover.iter())
            .map(|(spec, seg)| (spec.name.clone(), (*seg).to_string()))
            .collect();
        self.admit(node, node_path, path_args, ctx)
    }

    fn admit(
        &self,
        node: &RouteNode,
        node_path: String,
        path_args: Vec<(String, String)>,
        ctx: &ResolveContext<'_>,
    ) -> Result<Resolved, ServerError> {
        // 1. Capability filter.
        for cap in &node.required_capabilities {
            if !ctx.env_capabilities.iter().any(|c| c == cap) {
                return Err(ServerError::NotAvailable(format!(
                    "capability '{cap}' is not available"
                )));
            }
        }

        // 2. Authorization filter.
        if let Some(expr) = &node.auth {
            let tags: HashSet<&str> = ctx.auth_tags.iter().map(String::as_str).collect();
            if !expr.eval(&tags) {
                return Err(if tags.is_empty() {
                    ServerError::NotAuthenticated(format!(
                        "authentication required for '{node_path}'"
                    ))
                } else {
                    ServerError::NotAuthorized(format!(
                        "insufficient authorization for '{node_path}'"
                    ))
                });
            }
        }

        // 3. Argument binding.
        let bound_args = bind_args(&node.arg_schema, &path_args, ctx.query, ctx.typed)?;

        // 4. Plugin filters, in registration order.
        if let Some(request) = ctx.request {
            for plugin in &self.plugins {
                if let Decision::Deny(err) = plugin.filter(node, request) {
                    return Err(err);
                }
            }
        }

        let handler = node.handler.clone().ok_or_else(|| {
            ServerError::NotFound(format!("no handler at '{node_path}'"))
        })?;

        Ok(Resolved {
            node_path,
            handler,
            bound_args,
            metadata: node.merged_metadata.clone(),
            owner: node.owner,
        })
    }

    /// Snapshot of the tree for documentation. Never mutates the tree.
    pub fn nodes(&self, basepath: &str, mode: IntrospectionMode) -> serde_json::Value {
        let mut node = &self.root;
        for segment in basepath.split('/').filter(|s| !s.is_empty()) {
            match node.child(segment) {
                Some(child) => node = child,
                None => return serde_json::Value::Null,
            }
        }
        match mode {
            IntrospectionMode::Tree => Self::tree_snapshot(node),
            IntrospectionMode::Flat => {
                let mut flat = Vec::new();
                Self::flat_snapshot(node, basepath.trim_end_matches('/'), &mut flat);
                serde_json::Value::Array(flat)
            }
            IntrospectionMode::OpenApi => {
                let mut paths = serde_json::Map::new();
                Self::openapi_paths(node, basepath.trim_end_matches('/'), &mut paths);
                serde_json::json!({ "openapi": "3.0.3", "paths": paths })
            }
        }
    }

    fn tree_snapshot(node: &RouteNode) -> serde_json::Value {
        serde_json::json!({
            "name": node.name,
            "handler": node.handler.is_some(),
            "metadata": node.metadata,
            "children": node
                .children
                .iter()
                .map(Self::tree_snapshot)
                .collect::<Vec<_>>(),
        })
    }

    fn flat_snapshot(node: &RouteNode, prefix: &str, out: &mut Vec<serde_json::Value>) {
        if node.handler.is_some() {
            out.push(serde_json::json!({
                "path": if prefix.is_empty() { "/".to_string() } else { prefix.to_string() },
                "name": node.name,
                "metadata": node.merged_metadata,
                "args": node
                    .arg_schema
                    .iter()
                    .map(|a| serde_json::json!({
                        "name": a.name,
                        "kind": a.kind.as_str(),
                        "required": a.required,
                    }))
                    .collect::<Vec<_>>(),
            }));
        }
        for child in &node.children {
            let child_prefix = format!("{prefix}/{}", child.name);
            Self::flat_snapshot(child, &child_prefix, out);
        }
    }

    fn openapi_paths(
        node: &RouteNode,
        prefix: &str,
        out: &mut serde_json::Map<String, serde_json::Value>,
    ) {
        if node.handler.is_some() {
            let parameters: Vec<serde_json::Value> = node
                .arg_schema
                .iter()
                .map(|a| {
                    serde_json::json!({
                        "name": a.name,
                        "in": "query",
                        "required": a.required,
                        "schema": { "type": openapi_type(a) },
                    })
                })
                .collect();
            let content_type = node
                .merged_metadata
                .get("content_type")
                .and_then(|v| v.as_str())
                .unwrap_or("application/json");
            out.insert(
                if prefix.is_empty() { "/".to_string() } else { prefix.to_string() },
                serde_json::json!({
                    "get": {
                        "operationId": node.name,
                        "parameters": parameters,
                        "responses": {
                            "200": { "description": "OK", "content": { content_type: {} } }
                        },
                    }
                }),
            );
        }
        for child in &node.children {
            // Parameter segments use the brace convention in documentation.
            let part = match &child.param {
                Some(slot) => format!("{{{slot}}}"),
                None => child.name.clone(),
            };
            let child_prefix = format!("{prefix}/{part}");
            Self::openapi_paths(child, &child_prefix, out);
        }
    }
}

fn openapi_type(spec: &ArgSpec) -> &'static str {
    use crate::args::ArgKind;
    match spec.kind {
        ArgKind::Int => "integer",
        ArgKind::Float | ArgKind::Decimal => "number",
        ArgKind::Bool => "boolean",
        ArgKind::Json => "object",
        _ => "string",
    }
}
