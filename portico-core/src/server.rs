//! The root container: owns the router, registries, pipelines, mounted
//! apps, and the lifespan manager, and exposes the single transport entry
//! point [`Server::handle`].
//!
//! The server itself participates in the route tree as the root routing
//! instance; operator endpoints live under the reserved `_server/` prefix
//! to keep them apart from the user surface.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::args::{ArgKind, ArgSpec};
use crate::auth::{AuthBackend, JwtAuthBackend};
use crate::config::{Config, ServerSettings};
use crate::dispatcher::{Dispatcher, WsConnectionHandler};
use crate::error::ServerError;
use crate::lifespan::LifespanManager;
use crate::middleware::{enabled_by_config, Middleware, MiddlewarePipeline, ServerCall};
use crate::middlewares::{
    Authentication, Compression, Cors, ErrorTranslation, RateLimit, RequestLogging, Session,
};
use crate::registry::RequestRegistry;
use crate::request::BodyLimits;
use crate::response::{Metadata, Payload};
use crate::router::{IntrospectionMode, Router, RouterPlugin};
use crate::routes::{BoxFuture, Handler, Outcome, Route, RouteSet, RoutingInstance};
use crate::session::InMemorySessionStore;
use crate::transport::{ReceiveEvent, Scope, ScopeKind, SendEvent, TransportSender};

/// Reserved prefix for operator endpoints.
pub const RESERVED_PREFIX: &str = "_server";

/// A mounted sub-application: a routing instance with a name, optional
/// app-local middlewares and plugins, and lifecycle hooks.
pub trait AppInstance: RoutingInstance {
    fn name(&self) -> &str;

    /// Middlewares applied only to requests resolving into this app's
    /// subtree (appended to the global chain, then re-sorted by order).
    fn middlewares(&self) -> Vec<Arc<dyn Middleware>> {
        Vec::new()
    }

    /// Router plugins contributed by this app.
    fn plugins(&self) -> Vec<Arc<dyn RouterPlugin>> {
        Vec::new()
    }

    fn on_startup(&self) -> BoxFuture<Result<(), ServerError>> {
        Box::pin(async { Ok(()) })
    }

    fn on_shutdown(&self) -> BoxFuture<Result<(), ServerError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Shared state captured by the reserved system handlers.
struct SystemState {
    router: OnceLock<Arc<Router>>,
    openapi_info: serde_json::Value,
    main_app: Option<String>,
    resource_root: Option<PathBuf>,
    jwt: Option<Arc<JwtAuthBackend>>,
}

/// The server's own routing instance (reserved subtree plus root index).
struct SystemInstance {
    state: Arc<SystemState>,
}

impl SystemInstance {
    fn redirect_target(state: &SystemState) -> Option<String> {
        state.main_app.as_ref().map(|app| format!("/{app}/"))
    }

    fn routes_for(state: Arc<SystemState>) -> RouteSet {
        let index_state = state.clone();
        let index = Handler::asynchronous(move |call| {
            let target = Self::redirect_target(&index_state);
            async move {
                match target {
                    Some(location) => {
                        call.request.with_response(|response| {
                            response.append_header("location", location.clone());
                        })?;
                        let mut meta = Metadata::new();
                        meta.insert("status".to_string(), serde_json::json!(302));
                        Ok(Outcome::with_metadata(Payload::None, meta))
                    }
                    None => Ok(Outcome::value(Payload::Text(
                        "portico application server".to_string(),
                    ))),
                }
            }
        });

        let openapi_state = state.clone();
        let openapi = Handler::asynchronous(move |_call| {
            let state = openapi_state.clone();
            async move {
                let mut document = state
                    .router
                    .get()
                    .map(|router| router.nodes("", IntrospectionMode::OpenApi))
                    .unwrap_or(serde_json::Value::Null);
                if let Some(doc) = document.as_object_mut() {
                    doc.insert("info".to_string(), state.openapi_info.clone());
                }
                Ok(Outcome::value(document))
            }
        });

        let resource_state = state.clone();
        let resource = Handler::asynchronous(move |call| {
            let root = resource_state.resource_root.clone();
            async move {
                let name = call
                    .args
                    .get_str("name")
                    .unwrap_or_default()
                    .to_string();
                let root = root.ok_or_else(|| {
                    ServerError::NotAvailable("no resource root configured".to_string())
                })?;
                if name.is_empty()
                    || name.starts_with('/')
                    || name.split('/').any(|part| part == "..")
                {
                    return Err(ServerError::Validation(format!(
                        "invalid resource name {name:?}"
                    )));
                }
                Ok(Outcome::value(Payload::FilePath(root.join(name))))
            }
        });

        let jwt_state = state;
        let create_jwt = Handler::asynchronous(move |call| {
            let jwt = jwt_state.jwt.clone();
            async move {
                let jwt = jwt.ok_or_else(|| {
                    ServerError::NotAvailable("no token backend configured".to_string())
                })?;
                let sub = call.args.get_str("sub").unwrap_or_default().to_string();
                let tags: Vec<String> = call
                    .args
                    .get_str("tags")
                    .unwrap_or_default()
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect();
                let ttl = match call.args.get("ttl") {
                    Some(portico_codec::TypedValue::Int(secs)) => *secs as u64,
                    _ => 3600,
                };
                let token = jwt.mint(&sub, &tags, ttl)?;
                Ok(Outcome::value(serde_json::json!({ "token": token })))
            }
        });

        RouteSet::new()
            .route(Route::handler("index", index.clone()))
            .route(
                Route::subtree(RESERVED_PREFIX)
                    .child(Route::handler("index", index))
                    .child(Route::handler("_openapi", openapi))
                    .child(
                        Route::handler("_resource", resource)
                            .arg(ArgSpec::required("name", ArgKind::Str)),
                    )
                    .child(
                        Route::handler("_create_jwt", create_jwt)
                            .auth_tags("admin")
                            .arg(ArgSpec::required("sub", ArgKind::Str))
                            .arg(ArgSpec::optional(
                                "tags",
                                ArgKind::Str,
                                portico_codec::TypedValue::Str(String::new()),
                            ))
                            .arg(ArgSpec::optional(
                                "ttl",
                                ArgKind::Int,
                                portico_codec::TypedValue::Int(3600),
                            )),
                    ),
            )
    }
}

impl RoutingInstance for SystemInstance {
    fn routes(&self) -> RouteSet {
        Self::routes_for(self.state.clone())
    }
}

/// Constructor for apps mounted from configuration: receives the mount
/// name and the frozen config (its kwargs live under `apps.<name>.*`,
/// or `sys_apps.<name>.*` for system apps).
pub type AppFactory =
    Arc<dyn Fn(&str, &Config) -> Result<Arc<dyn AppInstance>, ServerError> + Send + Sync>;

/// Builder collecting apps, middlewares, plugins, and the WS handler, then
/// freezing everything into a [`Server`].
pub struct ServerBuilder {
    config: Config,
    apps: Vec<Arc<dyn AppInstance>>,
    app_factories: HashMap<String, AppFactory>,
    middlewares: Vec<Arc<dyn Middleware>>,
    plugins: Vec<Arc<dyn RouterPlugin>>,
    auth_backends: Vec<Arc<dyn AuthBackend>>,
    ws_handler: Option<Arc<dyn WsConnectionHandler>>,
}

impl ServerBuilder {
    pub fn new(config: Config) -> ServerBuilder {
        ServerBuilder {
            config,
            apps: Vec::new(),
            app_factories: HashMap::new(),
            middlewares: Vec::new(),
            plugins: Vec::new(),
            auth_backends: Vec::new(),
            ws_handler: None,
        }
    }

    /// Mount an app by its declared name; mount order is startup order.
    pub fn mount(mut self, app: Arc<dyn AppInstance>) -> ServerBuilder {
        self.apps.push(app);
        self
    }

    /// Register an app constructor under a module name. Configuration
    /// entries `apps.<name>.module: <module>` mount through it; the
    /// factory reads its kwargs from `apps.<name>.*`.
    pub fn register_app_factory(mut self, module: &str, factory: AppFactory) -> ServerBuilder {
        self.app_factories.insert(module.to_string(), factory);
        self
    }

    /// Add a server-wide middleware beyond the built-ins.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> ServerBuilder {
        self.middlewares.push(middleware);
        self
    }

    /// Register a router plugin.
    pub fn plugin(mut self, plugin: Arc<dyn RouterPlugin>) -> ServerBuilder {
        self.plugins.push(plugin);
        self
    }

    /// Add an authentication backend ahead of the configured JWT one.
    pub fn auth_backend(mut self, backend: Arc<dyn AuthBackend>) -> ServerBuilder {
        self.auth_backends.push(backend);
        self
    }

    /// Install the WebSocket connection handler (the page layer).
    pub fn ws_handler(mut self, handler: Arc<dyn WsConnectionHandler>) -> ServerBuilder {
        self.ws_handler = Some(handler);
        self
    }

    /// Wire everything together. The route tree is finalized here and
    /// read-only afterwards.
    pub fn build(self) -> Result<Server, ServerError> {
        let settings = ServerSettings::from_config(&self.config);

        // Programmatic mounts first, then configuration-driven ones in
        // name order (user apps, then system apps); the combined order is
        // the startup order.
        let mut apps = self.apps.clone();
        for section in ["apps", "sys_apps"] {
            for name in self.config.sections_under(section) {
                if apps.iter().any(|app| app.name() == name) {
                    continue;
                }
                let module: String = self
                    .config
                    .get(&format!("{section}.{name}.module"))
                    .map_err(|_| {
                        ServerError::Internal(format!(
                            "app '{name}' is configured without a module"
                        ))
                    })?;
                let factory = self.app_factories.get(&module).ok_or_else(|| {
                    ServerError::Internal(format!(
                        "no registered factory for app module '{module}'"
                    ))
                })?;
                apps.push(factory(&name, &self.config)?);
            }
        }

        let executor = Arc::new(portico_executor::ExecutionSubsystem::new(
            portico_executor::ExecutorConfig {
                blocking_threads: settings.execution_threads,
                cpu_workers: settings.execution_processes,
                task_workers: settings.tasks_max_workers,
                ..portico_executor::ExecutorConfig::default()
            },
        ));

        let registry = Arc::new(RequestRegistry::new(BodyLimits {
            max_bytes: settings.max_body_bytes,
            read_timeout: settings.body_read_timeout,
        }));

        let jwt = JwtAuthBackend::from_config(&self.config).map(Arc::new);
        let system_state = Arc::new(SystemState {
            router: OnceLock::new(),
            openapi_info: openapi_info(&self.config),
            main_app: settings.main_app.clone(),
            resource_root: self
                .config
                .get::<String>("server.resource_root")
                .ok()
                .map(PathBuf::from),
            jwt: jwt.clone(),
        });

        // Route tree: plugins first (so on_attach sees every mount), then
        // the server's own routes, then each app in mount order.
        let mut router = Router::new();
        for plugin in &self.plugins {
            router.register_plugin(plugin.clone());
        }
        for app in &apps {
            for plugin in app.plugins() {
                router.register_plugin(plugin);
            }
        }
        let system = SystemInstance {
            state: system_state.clone(),
        };
        router.attach_root(system.routes(), None)?;
        for (id, app) in apps.iter().enumerate() {
            if app.name() == RESERVED_PREFIX {
                return Err(ServerError::Internal(format!(
                    "app name '{RESERVED_PREFIX}' is reserved"
                )));
            }
            router.attach_instance(app.name(), app.routes(), id)?;
        }
        router.finalize()?;
        let router = Arc::new(router);
        let _ = system_state.router.set(router.clone());

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            router.clone(),
            executor.clone(),
            self.ws_handler.clone(),
            settings.max_body_bytes,
            settings.request_deadline,
        ));

        // Global chain: built-ins gated by configuration, plus user extras.
        let mut global: Vec<Arc<dyn Middleware>> = Vec::new();
        let mut candidates: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(ErrorTranslation::new(settings.debug)),
            Arc::new(RequestLogging),
            Arc::new(Compression),
        ];
        candidates.push(Arc::new(Cors::from_config(&self.config)));
        if let Some(rate_limit) = RateLimit::from_config(&self.config) {
            candidates.push(Arc::new(rate_limit));
        }
        let mut backends = self.auth_backends.clone();
        if let Some(jwt) = jwt {
            backends.push(jwt);
        }
        let capabilities: Vec<String> = self
            .config
            .get("server.capabilities")
            .unwrap_or_default();
        candidates.push(Arc::new(Authentication::new(backends, capabilities)));
        if self.config.get_or("session.enabled", false) {
            let ttl = std::time::Duration::from_secs(
                self.config.get_or("session.ttl_secs", 3600),
            );
            candidates.push(Arc::new(Session::new(Arc::new(InMemorySessionStore::new(
                ttl,
            )))));
        }
        for candidate in candidates {
            if enabled_by_config(candidate.as_ref(), &self.config) {
                global.push(candidate);
            }
        }
        global.extend(self.middlewares.iter().cloned());

        // One pipeline per app subtree (global chain plus the app's own),
        // and the default pipeline for everything else.
        let mut pipelines = HashMap::new();
        for app in &apps {
            let mut chain = global.clone();
            chain.extend(app.middlewares());
            pipelines.insert(
                app.name().to_string(),
                MiddlewarePipeline::new(chain, dispatcher.clone()),
            );
        }
        let default_pipeline = MiddlewarePipeline::new(global, dispatcher.clone());

        Ok(Server {
            inner: Arc::new(ServerInner {
                config: self.config,
                settings,
                registry,
                router,
                pipelines,
                default_pipeline,
                lifespan: LifespanManager::new(executor.clone(), apps.clone()),
                executor,
            }),
        })
    }
}

fn openapi_info(config: &Config) -> serde_json::Value {
    serde_json::json!({
        "title": config.get_or("openapi.title", "Portico".to_string()),
        "version": config.get_or("openapi.version", "0.1.0".to_string()),
        "description": config.get_or("openapi.description", String::new()),
    })
}

struct ServerInner {
    config: Config,
    settings: ServerSettings,
    registry: Arc<RequestRegistry>,
    router: Arc<Router>,
    pipelines: HashMap<String, MiddlewarePipeline>,
    default_pipeline: MiddlewarePipeline,
    lifespan: LifespanManager,
    executor: Arc<portico_executor::ExecutionSubsystem>,
}

/// The composed server. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn builder(config: Config) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.inner.settings
    }

    /// The frozen configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.inner.registry
    }

    pub fn executor(&self) -> &Arc<portico_executor::ExecutionSubsystem> {
        &self.inner.executor
    }

    pub fn lifespan(&self) -> &LifespanManager {
        &self.inner.lifespan
    }

    /// Pick the pipeline for a request path: the app-local chain when the
    /// first segment names a mounted app, the default chain otherwise.
    fn pipeline_for(&self, path: &str) -> &MiddlewarePipeline {
        let first = path.split('/').find(|s| !s.is_empty()).unwrap_or("");
        self.inner
            .pipelines
            .get(first)
            .unwrap_or(&self.inner.default_pipeline)
    }

    /// The single transport entry point: lifespan events go to the
    /// lifespan manager, everything else through the pipeline.
    pub async fn handle(
        &self,
        scope: Scope,
        receive: mpsc::Receiver<ReceiveEvent>,
        sender: TransportSender,
    ) -> Result<(), ServerError> {
        match scope.kind {
            ScopeKind::Lifespan => self.handle_lifespan(receive, sender).await,
            _ => {
                let pipeline = self.pipeline_for(&scope.raw_path);
                let cancel = CancellationToken::new();
                let mut call = ServerCall::new(scope, receive, sender, cancel);
                pipeline.run(&mut call).await
            }
        }
    }

    /// Cancellation-aware variant: the transport's token cancels the
    /// in-flight request when the client disconnects.
    pub async fn handle_with_cancel(
        &self,
        scope: Scope,
        receive: mpsc::Receiver<ReceiveEvent>,
        sender: TransportSender,
        cancel: CancellationToken,
    ) -> Result<(), ServerError> {
        match scope.kind {
            ScopeKind::Lifespan => self.handle_lifespan(receive, sender).await,
            _ => {
                let pipeline = self.pipeline_for(&scope.raw_path);
                let mut call = ServerCall::new(scope, receive, sender, cancel);
                pipeline.run(&mut call).await
            }
        }
    }

    async fn handle_lifespan(
        &self,
        mut receive: mpsc::Receiver<ReceiveEvent>,
        sender: TransportSender,
    ) -> Result<(), ServerError> {
        while let Some(event) = receive.recv().await {
            match event {
                ReceiveEvent::Startup => {
                    let ack = match self.inner.lifespan.startup().await {
                        Ok(()) => SendEvent::StartupComplete,
                        Err(err) => SendEvent::StartupFailed {
                            message: err.to_string(),
                        },
                    };
                    sender.send(ack).await?;
                }
                ReceiveEvent::Shutdown => {
                    let ack = match self.inner.lifespan.shutdown().await {
                        Ok(()) => SendEvent::ShutdownComplete,
                        Err(err) => SendEvent::ShutdownFailed {
                            message: err.to_string(),
                        },
                    };
                    sender.send(ack).await?;
                    return Ok(());
                }
                other => {
                    return Err(ServerError::Protocol(format!(
                        "unexpected lifespan event: {other:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}
