//! The transport-agnostic request handle.
//!
//! A request exposes read-only views over the parsed transport payload.
//! The body is materialized lazily: the first reader drains chunk events
//! from the transport, subject to the configured size limit and read
//! deadline, and later readers see the cached bytes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method};
use portico_codec::TypedValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ServerError;
use crate::response::Response;
use crate::transport::{AuthRecord, ReceiveEvent, Scope, TransportKind};

/// Shared, cheaply clonable request handle.
pub type RequestHandle = Arc<Request>;

/// Limits applied while draining the request body.
#[derive(Clone, Copy, Debug)]
pub struct BodyLimits {
    pub max_bytes: usize,
    pub read_timeout: Duration,
}

impl Default for BodyLimits {
    fn default() -> Self {
        BodyLimits {
            max_bytes: 16 * 1024 * 1024,
            read_timeout: Duration::from_secs(30),
        }
    }
}

enum BodyState {
    Pending(mpsc::Receiver<ReceiveEvent>),
    Ready(Bytes),
}

/// Mutable per-request state populated by middlewares.
#[derive(Debug, Default)]
struct RequestState {
    auth_tags: Vec<String>,
    env_capabilities: Vec<String>,
    auth: Option<AuthRecord>,
    session_id: Option<String>,
}

/// One in-flight request, owned by the [`RequestRegistry`](crate::registry::RequestRegistry).
pub struct Request {
    id: String,
    kind: TransportKind,
    method: Method,
    path: String,
    headers: HeaderMap,
    cookies: Vec<(String, String)>,
    query: Vec<(String, String)>,
    typed: bool,
    created_at: DateTime<Utc>,
    limits: BodyLimits,
    state: Mutex<RequestState>,
    body: tokio::sync::Mutex<BodyState>,
    response: Mutex<Option<Response>>,
    cancel: CancellationToken,
    extra_response_headers: Vec<(String, String)>,
    allow_compression: bool,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("kind", &self.kind.as_str())
            .field("method", &self.method)
            .field("path", &self.path)
            .finish()
    }
}

/// Parse a `Cookie` header into name/value pairs.
fn parse_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut cookies = Vec::new();
    for value in headers.get_all(http::header::COOKIE) {
        let Ok(text) = value.to_str() else { continue };
        for pair in text.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                cookies.push((name.trim().to_string(), value.trim().to_string()));
            }
        }
    }
    cookies
}

/// True when the request indicates typed mode via `Content-Type` or `Accept`.
fn typed_mode(headers: &HeaderMap) -> bool {
    for name in [http::header::CONTENT_TYPE, http::header::ACCEPT] {
        if let Some(value) = headers.get(&name).and_then(|v| v.to_str().ok()) {
            if portico_codec::typed_format(value).is_some() {
                return true;
            }
        }
    }
    false
}

impl Request {
    /// Build a request from a scope and its inbound channel.
    ///
    /// `id` is the correlation id chosen by the registry. The path is
    /// percent-decoded here; a path that does not decode to UTF-8 is a
    /// protocol error.
    pub(crate) fn from_scope(
        id: String,
        kind: TransportKind,
        scope: &Scope,
        receive: mpsc::Receiver<ReceiveEvent>,
        limits: BodyLimits,
        cancel: CancellationToken,
    ) -> Result<Request, ServerError> {
        let path = percent_encoding::percent_decode_str(&scope.raw_path)
            .decode_utf8()
            .map_err(|_| ServerError::Protocol("request path is not valid UTF-8".to_string()))?
            .into_owned();
        let query: Vec<(String, String)> =
            form_urlencoded::parse(&scope.query_string)
                .into_owned()
                .collect();

        let state = RequestState {
            auth_tags: scope.auth_tags.clone(),
            env_capabilities: scope.env_capabilities.clone(),
            auth: scope.auth.clone(),
            session_id: scope.session_id.clone(),
        };

        Ok(Request {
            id,
            kind,
            method: scope.method.clone(),
            typed: typed_mode(&scope.headers),
            cookies: parse_cookies(&scope.headers),
            headers: scope.headers.clone(),
            path,
            query,
            created_at: Utc::now(),
            limits,
            state: Mutex::new(state),
            body: tokio::sync::Mutex::new(BodyState::Pending(receive)),
            response: Mutex::new(Some(Response::new())),
            cancel,
            extra_response_headers: scope.extra_response_headers.clone(),
            allow_compression: scope.allow_compression,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transport(&self) -> TransportKind {
        self.kind
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Percent-decoded request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Decoded query pairs in wire order.
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// Whether the client asked for typed mode.
    pub fn typed(&self) -> bool {
        self.typed
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Cancellation token for this request; child tokens are handed to any
    /// nested pool submissions.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn auth_tags(&self) -> Vec<String> {
        self.state.lock().unwrap().auth_tags.clone()
    }

    pub fn env_capabilities(&self) -> Vec<String> {
        self.state.lock().unwrap().env_capabilities.clone()
    }

    pub fn auth(&self) -> Option<AuthRecord> {
        self.state.lock().unwrap().auth.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.lock().unwrap().session_id.clone()
    }

    /// Extra response headers contributed by middlewares on the way in.
    pub fn extra_response_headers(&self) -> &[(String, String)] {
        &self.extra_response_headers
    }

    /// Whether the compression middleware allowed compressing the response.
    pub fn allow_compression(&self) -> bool {
        self.allow_compression
    }

    /// Run `f` against the attached response builder.
    ///
    /// Returns `Internal` if the response was already taken for emission.
    pub fn with_response<R>(
        &self,
        f: impl FnOnce(&mut Response) -> R,
    ) -> Result<R, ServerError> {
        let mut guard = self.response.lock().unwrap();
        match guard.as_mut() {
            Some(response) => Ok(f(response)),
            None => Err(ServerError::Internal(
                "response was already emitted".to_string(),
            )),
        }
    }

    /// Take the response builder for emission. Single use.
    pub fn take_response(&self) -> Result<Response, ServerError> {
        self.response.lock().unwrap().take().ok_or_else(|| {
            ServerError::Internal("response was already emitted".to_string())
        })
    }

    /// Declared `Content-Length`, when the transport provided one.
    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }

    /// Materialize the request body.
    ///
    /// Drains incremental chunks until the end-of-body marker, enforcing
    /// the size limit and the read deadline. The result is cached; calling
    /// again returns the cached bytes.
    pub async fn body(&self) -> Result<Bytes, ServerError> {
        let mut guard = self.body.lock().await;
        match &mut *guard {
            BodyState::Ready(bytes) => Ok(bytes.clone()),
            BodyState::Pending(rx) => {
                let mut collected = BytesMut::new();
                let deadline = tokio::time::Instant::now() + self.limits.read_timeout;
                loop {
                    let event = tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return Err(ServerError::Cancelled("client disconnected".to_string()));
                        }
                        _ = tokio::time::sleep_until(deadline) => {
                            return Err(ServerError::Timeout("request body read timed out".to_string()));
                        }
                        event = rx.recv() => event,
                    };
                    match event {
                        Some(ReceiveEvent::Body { bytes, more }) => {
                            if collected.len() + bytes.len() > self.limits.max_bytes {
                                return Err(ServerError::Protocol(
                                    "request body exceeds the configured limit".to_string(),
                                ));
                            }
                            collected.extend_from_slice(&bytes);
                            if !more {
                                break;
                            }
                        }
                        Some(ReceiveEvent::WsDisconnect { .. }) | None => {
                            return Err(ServerError::Cancelled(
                                "client disconnected during body read".to_string(),
                            ));
                        }
                        Some(other) => {
                            return Err(ServerError::Protocol(format!(
                                "unexpected transport event during body read: {other:?}"
                            )));
                        }
                    }
                }
                let bytes = collected.freeze();
                *guard = BodyState::Ready(bytes.clone());
                Ok(bytes)
            }
        }
    }

    /// Materialize and decode the body according to the request's mode:
    /// typed JSON/msgpack in typed mode, plain JSON otherwise.
    pub async fn typed_body(&self) -> Result<TypedValue, ServerError> {
        let bytes = self.body().await?;
        if bytes.is_empty() {
            return Ok(TypedValue::Null);
        }
        let content_type = self.header("content-type").unwrap_or("");
        match portico_codec::typed_format(content_type) {
            Some(portico_codec::WireFormat::Msgpack) => {
                Ok(portico_codec::from_typed_msgpack(&bytes)?)
            }
            Some(portico_codec::WireFormat::Json) => {
                let text = std::str::from_utf8(&bytes)
                    .map_err(|_| ServerError::Validation("body is not UTF-8".to_string()))?;
                Ok(portico_codec::from_typed_json(text)?)
            }
            None => {
                let value: serde_json::Value = serde_json::from_slice(&bytes)
                    .map_err(|e| ServerError::Validation(format!("invalid JSON body: {e}")))?;
                Ok(TypedValue::from_plain(value))
            }
        }
    }

    // ── Middleware-facing mutation ───────────────────────────────────────

    pub fn set_auth(&self, record: AuthRecord) {
        let mut state = self.state.lock().unwrap();
        state.auth_tags = record.tags.clone();
        state.auth = Some(record);
    }

    pub fn set_env_capabilities(&self, caps: Vec<String>) {
        self.state.lock().unwrap().env_capabilities = caps;
    }

    pub fn set_session_id(&self, id: String) {
        self.state.lock().unwrap().session_id = Some(id);
    }
}
