//! The transport contract between a protocol server and the core.
//!
//! A transport delivers each connection-level event as a [`Scope`] plus a
//! pair of channels: inbound [`ReceiveEvent`]s and outbound [`SendEvent`]s.
//! The core never touches sockets; protocol bindings (see `portico-http`)
//! translate between the wire and these types.

use bytes::Bytes;
use http::{HeaderMap, Method};
use tokio::sync::mpsc;

use crate::error::ServerError;

/// Default depth of the outbound frame channel; the bound is what gives
/// response streaming its backpressure.
pub const SEND_CHANNEL_DEPTH: usize = 32;

/// Transport kind of an in-flight request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Http,
    /// A message of the extended WS protocol dispatched as a request.
    WsMsg,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::WsMsg => "ws-msg",
        }
    }
}

/// Authentication record installed on the scope by the auth middleware.
#[derive(Clone, Debug, Default)]
pub struct AuthRecord {
    pub identity: String,
    pub tags: Vec<String>,
    pub backend: String,
}

/// What kind of connection-level event this scope describes.
#[derive(Clone, Debug)]
pub enum ScopeKind {
    Http,
    WebSocket { subprotocols: Vec<String> },
    Lifespan,
}

/// One transport event's immutable envelope plus the slots middlewares may
/// populate on the way in (auth tags, capabilities, session).
#[derive(Debug)]
pub struct Scope {
    pub kind: ScopeKind,
    /// Which request factory the dispatcher resolves for this scope.
    pub transport: TransportKind,
    pub method: Method,
    /// Raw (still percent-encoded) path as received.
    pub raw_path: String,
    pub query_string: Bytes,
    pub headers: HeaderMap,
    pub scheme: String,
    pub server: Option<(String, u16)>,
    pub client: Option<(String, u16)>,
    pub root_path: String,

    // Populated by middlewares before dispatch.
    pub auth_tags: Vec<String>,
    pub env_capabilities: Vec<String>,
    pub auth: Option<AuthRecord>,
    pub session_id: Option<String>,
    /// Extra response headers contributed by middlewares (e.g. CORS).
    pub extra_response_headers: Vec<(String, String)>,
    /// Set by the compression middleware when the response body may be
    /// gzip-compressed for this client.
    pub allow_compression: bool,
}

impl Scope {
    /// A bare HTTP scope for the given method and target, used by tests and
    /// by the WS layer when synthesizing per-message request scopes.
    pub fn http(method: Method, target: &str) -> Scope {
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), Bytes::copy_from_slice(q.as_bytes())),
            None => (target.to_string(), Bytes::new()),
        };
        Scope {
            kind: ScopeKind::Http,
            transport: TransportKind::Http,
            method,
            raw_path: path,
            query_string: query,
            headers: HeaderMap::new(),
            scheme: "http".to_string(),
            server: None,
            client: None,
            root_path: String::new(),
            auth_tags: Vec::new(),
            env_capabilities: Vec::new(),
            auth: None,
            session_id: None,
            extra_response_headers: Vec::new(),
            allow_compression: false,
        }
    }

    /// A lifespan scope; lifespan events bypass the pipeline entirely.
    pub fn lifespan() -> Scope {
        let mut scope = Scope::http(Method::GET, "/");
        scope.kind = ScopeKind::Lifespan;
        scope
    }
}

/// Inbound events produced by the transport.
#[derive(Clone, Debug)]
pub enum ReceiveEvent {
    /// A chunk of HTTP request body; `more` is false on the final chunk.
    Body { bytes: Bytes, more: bool },
    /// WebSocket connection opened by the client.
    WsConnect,
    /// A WebSocket message.
    WsMessage(WsPayload),
    /// WebSocket closed by the client.
    WsDisconnect { code: u16 },
    /// Lifespan startup notification.
    Startup,
    /// Lifespan shutdown notification.
    Shutdown,
}

/// Outbound events consumed by the transport.
#[derive(Clone, Debug)]
pub enum SendEvent {
    /// HTTP response head; sent exactly once, before any body frame.
    Start {
        status: http::StatusCode,
        headers: Vec<(String, String)>,
    },
    /// HTTP response body chunk; `more` is false on the terminator.
    Body { bytes: Bytes, more: bool },
    /// Accept a WebSocket connection.
    WsAccept { subprotocol: Option<String> },
    /// A WebSocket message.
    WsMessage(WsPayload),
    /// Close the WebSocket.
    WsClose { code: u16, reason: String },
    /// Lifespan startup acknowledged.
    StartupComplete,
    StartupFailed { message: String },
    /// Lifespan shutdown acknowledged.
    ShutdownComplete,
    ShutdownFailed { message: String },
}

/// Text or binary WebSocket payload.
#[derive(Clone, Debug)]
pub enum WsPayload {
    Text(String),
    Binary(Bytes),
}

/// Sender half handed to the core for one transport event.
///
/// Tracks whether the response head was emitted, so error translation can
/// tell a fresh connection from one that is already streaming.
#[derive(Clone, Debug)]
pub struct TransportSender {
    tx: mpsc::Sender<SendEvent>,
    started: std::sync::Arc<std::sync::atomic::AtomicBool>,
    status: std::sync::Arc<std::sync::atomic::AtomicU16>,
}

impl TransportSender {
    pub fn new(tx: mpsc::Sender<SendEvent>) -> Self {
        Self {
            tx,
            started: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
            status: std::sync::Arc::new(std::sync::atomic::AtomicU16::new(0)),
        }
    }

    /// True once a `Start` frame has been sent.
    pub fn response_started(&self) -> bool {
        self.started.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Status of the emitted response head, if one went out.
    pub fn sent_status(&self) -> Option<u16> {
        match self.status.load(std::sync::atomic::Ordering::Acquire) {
            0 => None,
            code => Some(code),
        }
    }

    /// Send one event, waiting for channel capacity (backpressure).
    pub async fn send(&self, event: SendEvent) -> Result<(), ServerError> {
        if let SendEvent::Start { status, .. } = &event {
            self.started
                .store(true, std::sync::atomic::Ordering::Release);
            self.status
                .store(status.as_u16(), std::sync::atomic::Ordering::Release);
        }
        self.tx
            .send(event)
            .await
            .map_err(|_| ServerError::Cancelled("transport closed".to_string()))
    }
}

/// Build a connected channel pair for one transport event.
///
/// Returns `(receive-side given to the core, inbound sender kept by the
/// transport, outbound receiver kept by the transport)`.
pub fn channel_pair(
    depth: usize,
) -> (
    mpsc::Receiver<ReceiveEvent>,
    mpsc::Sender<ReceiveEvent>,
    TransportSender,
    mpsc::Receiver<SendEvent>,
) {
    let (in_tx, in_rx) = mpsc::channel(depth.max(1));
    let (out_tx, out_rx) = mpsc::channel(SEND_CHANNEL_DEPTH);
    (in_rx, in_tx, TransportSender::new(out_tx), out_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sender_tracks_response_start() {
        let (_rx, _in_tx, sender, mut out_rx) = channel_pair(4);
        assert!(!sender.response_started());
        sender
            .send(SendEvent::Start {
                status: http::StatusCode::OK,
                headers: vec![],
            })
            .await
            .unwrap();
        assert!(sender.response_started());
        assert!(matches!(
            out_rx.recv().await,
            Some(SendEvent::Start { .. })
        ));
    }

    #[test]
    fn scope_splits_query_from_target() {
        let scope = Scope::http(Method::GET, "/shop/products?category=books");
        assert_eq!(scope.raw_path, "/shop/products");
        assert_eq!(&scope.query_string[..], b"category=books");
    }
}
