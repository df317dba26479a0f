//! Built-in middlewares for the standard order slots.
//!
//! Each implements [`Middleware`](crate::middleware::Middleware) and is
//! wired by the server builder from configuration; `middleware.<name>`
//! keys toggle them per deployment.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use http::StatusCode;

use crate::auth::AuthBackend;
use crate::config::Config;
use crate::error::ServerError;
use crate::middleware::{order, Middleware, MwFuture, Next, ServerCall};
use crate::response::{Metadata, Payload, Response};
use crate::session::{SessionStore, SESSION_COOKIE};

// ── ErrorTranslation (100) ───────────────────────────────────────────────

/// Outermost layer: converts bubbled errors into HTTP responses per the
/// status table. If the response head already went out, the error can only
/// be logged and propagated so the transport closes the stream.
pub struct ErrorTranslation {
    debug: bool,
}

impl ErrorTranslation {
    pub fn new(debug: bool) -> ErrorTranslation {
        ErrorTranslation { debug }
    }
}

impl Middleware for ErrorTranslation {
    fn name(&self) -> &'static str {
        "errors"
    }

    fn order(&self) -> i32 {
        order::ERROR_TRANSLATION
    }

    fn handle<'a>(&'a self, call: &'a mut ServerCall, next: Next<'a>) -> MwFuture<'a> {
        Box::pin(async move {
            match next.run(call).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    if call.sender.response_started() {
                        tracing::error!(error = %err, "error after response start");
                        return Err(err);
                    }
                    match &err {
                        ServerError::Internal(message) => {
                            tracing::error!(%message, "request failed");
                        }
                        other => {
                            tracing::debug!(error = %other, "request rejected");
                        }
                    }
                    call.send_error(&err, self.debug).await
                }
            }
        })
    }
}

// ── RateLimit (150) ──────────────────────────────────────────────────────

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter keyed by client address, fed by
/// `limits.rate_limit.default` (`"<max>/<window_secs>"`).
pub struct RateLimit {
    buckets: DashMap<String, TokenBucket>,
    max_tokens: f64,
    window: Duration,
}

impl RateLimit {
    pub fn new(max: u64, window: Duration) -> RateLimit {
        RateLimit {
            buckets: DashMap::new(),
            max_tokens: max as f64,
            window,
        }
    }

    /// Parse `limits.rate_limit.default`; absent key means no limiter.
    pub fn from_config(config: &Config) -> Option<RateLimit> {
        let spec: String = config.get("limits.rate_limit.default").ok()?;
        let (max, window) = spec.split_once('/')?;
        Some(RateLimit::new(
            max.trim().parse().ok()?,
            Duration::from_secs(window.trim().parse().ok()?),
        ))
    }

    fn try_acquire(&self, key: &str) -> bool {
        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket {
                tokens: self.max_tokens,
                last_refill: Instant::now(),
            });
        let bucket = entry.value_mut();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        let refill = (elapsed.as_secs_f64() / self.window.as_secs_f64()) * self.max_tokens;
        bucket.tokens = (bucket.tokens + refill).min(self.max_tokens);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Middleware for RateLimit {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn order(&self) -> i32 {
        order::RATE_LIMIT
    }

    fn handle<'a>(&'a self, call: &'a mut ServerCall, next: Next<'a>) -> MwFuture<'a> {
        Box::pin(async move {
            let key = call
                .scope
                .client
                .as_ref()
                .map(|(host, _)| host.clone())
                .unwrap_or_else(|| "unknown".to_string());
            if !self.try_acquire(&key) {
                let mut response = Response::new();
                response.set_result(
                    Payload::Value(portico_codec::TypedValue::Object(vec![(
                        "error".to_string(),
                        portico_codec::TypedValue::Str("rate_limited".to_string()),
                    )])),
                    Metadata::new(),
                    false,
                )?;
                response.set_status(StatusCode::TOO_MANY_REQUESTS);
                return call.send_response(response).await;
            }
            next.run(call).await
        })
    }
}

// ── RequestLogging (200) ─────────────────────────────────────────────────

/// Structured request log with elapsed time and emitted status.
pub struct RequestLogging;

impl Middleware for RequestLogging {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn order(&self) -> i32 {
        order::REQUEST_LOGGING
    }

    fn handle<'a>(&'a self, call: &'a mut ServerCall, next: Next<'a>) -> MwFuture<'a> {
        Box::pin(async move {
            let method = call.scope.method.clone();
            let path = call.scope.raw_path.clone();
            let started = Instant::now();
            let result = next.run(call).await;
            let elapsed_ms = started.elapsed().as_millis();
            let status = call.sender.sent_status().unwrap_or(0);
            tracing::info!(%method, %path, status, elapsed_ms, "request");
            result
        })
    }
}

// ── Cors (300) ───────────────────────────────────────────────────────────

/// Minimal CORS layer: answers preflights, stamps allow headers on the
/// way out via the scope's extra response headers.
pub struct Cors {
    allow_origin: String,
}

impl Cors {
    pub fn permissive() -> Cors {
        Cors {
            allow_origin: "*".to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Cors {
        let value = config.get_or("middleware.cors", "*".to_string());
        // `on`/`true` just enable the middleware; any other value is the
        // allowed origin.
        let allow_origin = match value.to_ascii_lowercase().as_str() {
            "on" | "true" | "1" => "*".to_string(),
            _ => value,
        };
        Cors { allow_origin }
    }
}

impl Middleware for Cors {
    fn name(&self) -> &'static str {
        "cors"
    }

    fn order(&self) -> i32 {
        order::CORS
    }

    fn default_enabled(&self) -> bool {
        false
    }

    fn handle<'a>(&'a self, call: &'a mut ServerCall, next: Next<'a>) -> MwFuture<'a> {
        Box::pin(async move {
            let origin = call
                .scope
                .headers
                .get(http::header::ORIGIN)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            if origin.is_none() {
                return next.run(call).await;
            }

            let allow = if self.allow_origin == "*" {
                "*".to_string()
            } else {
                self.allow_origin.clone()
            };

            if call.scope.method == http::Method::OPTIONS {
                let mut response = Response::new();
                response.set_status(StatusCode::NO_CONTENT);
                response.append_header("access-control-allow-origin", &allow);
                response.append_header(
                    "access-control-allow-methods",
                    "GET, POST, PUT, DELETE, OPTIONS",
                );
                response.append_header("access-control-allow-headers", "*");
                return call.send_response(response).await;
            }

            call.scope
                .extra_response_headers
                .push(("access-control-allow-origin".to_string(), allow));
            next.run(call).await
        })
    }
}

// ── Authentication (400) ─────────────────────────────────────────────────

/// Runs the configured backends in order; the first record wins and lands
/// on the scope (`auth_tags`, `auth`). Also stamps the environment's
/// capability set so route capability filters can see it.
pub struct Authentication {
    backends: Vec<Arc<dyn AuthBackend>>,
    capabilities: Vec<String>,
}

impl Authentication {
    pub fn new(backends: Vec<Arc<dyn AuthBackend>>, capabilities: Vec<String>) -> Authentication {
        Authentication {
            backends,
            capabilities,
        }
    }
}

impl Middleware for Authentication {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn order(&self) -> i32 {
        order::AUTHENTICATION
    }

    fn handle<'a>(&'a self, call: &'a mut ServerCall, next: Next<'a>) -> MwFuture<'a> {
        Box::pin(async move {
            call.scope.env_capabilities = self.capabilities.clone();
            for backend in &self.backends {
                if let Some(record) = backend.authenticate(&call.scope)? {
                    tracing::debug!(
                        identity = %record.identity,
                        backend = %record.backend,
                        "authenticated"
                    );
                    call.scope.auth_tags = record.tags.clone();
                    call.scope.auth = Some(record);
                    break;
                }
            }
            next.run(call).await
        })
    }
}

// ── Session (450) ────────────────────────────────────────────────────────

/// Binds a session id to the scope, creating one (and its cookie) when
/// the client has none.
pub struct Session {
    store: Arc<dyn SessionStore>,
}

impl Session {
    pub fn new(store: Arc<dyn SessionStore>) -> Session {
        Session { store }
    }
}

impl Middleware for Session {
    fn name(&self) -> &'static str {
        "session"
    }

    fn order(&self) -> i32 {
        order::SESSION
    }

    fn handle<'a>(&'a self, call: &'a mut ServerCall, next: Next<'a>) -> MwFuture<'a> {
        Box::pin(async move {
            let existing = call
                .scope
                .headers
                .get(http::header::COOKIE)
                .and_then(|v| v.to_str().ok())
                .and_then(|cookies| {
                    cookies.split(';').find_map(|pair| {
                        let (name, value) = pair.trim().split_once('=')?;
                        (name == SESSION_COOKIE).then(|| value.to_string())
                    })
                });

            let session_id = match existing {
                Some(id) if self.store.load(&id).is_some() => {
                    self.store.touch(&id);
                    id
                }
                _ => {
                    let id = ulid::Ulid::new().to_string();
                    self.store.save(&id, serde_json::json!({}));
                    call.scope.extra_response_headers.push((
                        "set-cookie".to_string(),
                        format!("{SESSION_COOKIE}={id}; Path=/; HttpOnly"),
                    ));
                    id
                }
            };
            call.scope.session_id = Some(session_id);
            next.run(call).await
        })
    }
}

// ── Compression (900) ────────────────────────────────────────────────────

/// Innermost layer: flags the scope when the client accepts gzip, so
/// response emission may compress buffered bodies.
pub struct Compression;

impl Middleware for Compression {
    fn name(&self) -> &'static str {
        "compression"
    }

    fn order(&self) -> i32 {
        order::COMPRESSION
    }

    fn handle<'a>(&'a self, call: &'a mut ServerCall, next: Next<'a>) -> MwFuture<'a> {
        Box::pin(async move {
            let accepts_gzip = call
                .scope
                .headers
                .get(http::header::ACCEPT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.contains("gzip"))
                .unwrap_or(false);
            call.scope.allow_compression = accepts_gzip;
            next.run(call).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{MiddlewarePipeline, Terminal};
    use crate::transport::{channel_pair, Scope, SendEvent};
    use http::Method;
    use tokio_util::sync::CancellationToken;

    struct FailingTerminal(ServerError);

    impl Terminal for FailingTerminal {
        fn dispatch<'a>(&'a self, _call: &'a mut ServerCall) -> MwFuture<'a> {
            let err = self.0.clone();
            Box::pin(async move { Err(err) })
        }
    }

    struct OkTerminal;

    impl Terminal for OkTerminal {
        fn dispatch<'a>(&'a self, _call: &'a mut ServerCall) -> MwFuture<'a> {
            Box::pin(async move { Ok(()) })
        }
    }

    fn call_with_scope(scope: Scope) -> (ServerCall, tokio::sync::mpsc::Receiver<SendEvent>) {
        let (in_rx, _t, sender, out_rx) = channel_pair(4);
        (
            ServerCall::new(scope, in_rx, sender, CancellationToken::new()),
            out_rx,
        )
    }

    #[tokio::test]
    async fn error_translation_maps_kinds_to_statuses() {
        let pipeline = MiddlewarePipeline::new(
            vec![Arc::new(ErrorTranslation::new(false))],
            Arc::new(FailingTerminal(ServerError::NotFound("x".into()))),
        );
        let (mut call, mut out) = call_with_scope(Scope::http(Method::GET, "/x"));
        pipeline.run(&mut call).await.unwrap();
        match out.recv().await.unwrap() {
            SendEvent::Start { status, .. } => assert_eq!(status, StatusCode::NOT_FOUND),
            other => panic!("expected Start, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limit_short_circuits_with_429() {
        let limiter = RateLimit::new(1, Duration::from_secs(60));
        let pipeline = MiddlewarePipeline::new(vec![Arc::new(limiter)], Arc::new(OkTerminal));

        let mut scope = Scope::http(Method::GET, "/x");
        scope.client = Some(("10.0.0.1".to_string(), 1234));
        let (mut call, _out) = call_with_scope(scope);
        pipeline.run(&mut call).await.unwrap();

        let mut scope = Scope::http(Method::GET, "/x");
        scope.client = Some(("10.0.0.1".to_string(), 1234));
        let (mut call, mut out) = call_with_scope(scope);
        pipeline.run(&mut call).await.unwrap();
        match out.recv().await.unwrap() {
            SendEvent::Start { status, .. } => {
                assert_eq!(status, StatusCode::TOO_MANY_REQUESTS)
            }
            other => panic!("expected Start, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cors_answers_preflight() {
        let pipeline = MiddlewarePipeline::new(
            vec![Arc::new(Cors::permissive())],
            Arc::new(OkTerminal),
        );
        let mut scope = Scope::http(Method::OPTIONS, "/x");
        scope
            .headers
            .insert(http::header::ORIGIN, "https://app.example".parse().unwrap());
        let (mut call, mut out) = call_with_scope(scope);
        pipeline.run(&mut call).await.unwrap();
        match out.recv().await.unwrap() {
            SendEvent::Start { status, headers } => {
                assert_eq!(status, StatusCode::NO_CONTENT);
                assert!(headers
                    .iter()
                    .any(|(n, v)| n == "access-control-allow-origin" && v == "*"));
            }
            other => panic!("expected Start, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn session_creates_cookie_when_absent() {
        let store = Arc::new(crate::session::InMemorySessionStore::new(
            Duration::from_secs(60),
        ));
        let pipeline = MiddlewarePipeline::new(
            vec![Arc::new(Session::new(store.clone()))],
            Arc::new(OkTerminal),
        );
        let (mut call, _out) = call_with_scope(Scope::http(Method::GET, "/x"));
        pipeline.run(&mut call).await.unwrap();
        assert!(call.scope.session_id.is_some());
        assert!(call
            .scope
            .extra_response_headers
            .iter()
            .any(|(n, v)| n == "set-cookie" && v.starts_with(SESSION_COOKIE)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn compression_flags_scope() {
        let pipeline =
            MiddlewarePipeline::new(vec![Arc::new(Compression)], Arc::new(OkTerminal));
        let mut scope = Scope::http(Method::GET, "/x");
        scope.headers.insert(
            http::header::ACCEPT_ENCODING,
            "gzip, deflate".parse().unwrap(),
        );
        let (mut call, _out) = call_with_scope(scope);
        pipeline.run(&mut call).await.unwrap();
        assert!(call.scope.allow_compression);
    }

    #[tokio::test]
    async fn auth_middleware_populates_scope() {
        let backend = Arc::new(crate::auth::JwtAuthBackend::new(b"secret"));
        let token = backend.mint("u1", &["admin".to_string()], 60).unwrap();
        let pipeline = MiddlewarePipeline::new(
            vec![Arc::new(Authentication::new(
                vec![backend],
                vec!["has_jwt".to_string()],
            ))],
            Arc::new(OkTerminal),
        );
        let mut scope = Scope::http(Method::GET, "/x");
        scope.headers.insert(
            http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        let (mut call, _out) = call_with_scope(scope);
        pipeline.run(&mut call).await.unwrap();
        assert_eq!(call.scope.auth_tags, vec!["admin"]);
        assert_eq!(call.scope.env_capabilities, vec!["has_jwt"]);
        assert_eq!(call.scope.auth.as_ref().unwrap().identity, "u1");
    }
}
