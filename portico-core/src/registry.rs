//! Factory and tracking of in-flight requests.
//!
//! The registry owns every request from `create` to `unregister` and
//! carries the per-task "current request" slot. The dispatcher guarantees
//! exactly one unregister per created request, on success and on failure.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ServerError;
use crate::request::{BodyLimits, Request, RequestHandle};
use crate::transport::{ReceiveEvent, Scope, TransportKind};

tokio::task_local! {
    static CURRENT_REQUEST: RequestHandle;
}

/// The active request of the current task, if the dispatcher installed one.
///
/// Never inherited across pool boundaries: code running on the blocking or
/// CPU pool receives the data it needs as arguments instead.
pub fn current_request() -> Option<RequestHandle> {
    CURRENT_REQUEST.try_with(|r| r.clone()).ok()
}

/// Run `fut` with `request` installed as the current request. The slot is
/// cleared when the future completes, normally or not.
pub async fn with_current_request<F: std::future::Future>(
    request: RequestHandle,
    fut: F,
) -> F::Output {
    CURRENT_REQUEST.scope(request, fut).await
}

type Factory = Arc<
    dyn Fn(
            String,
            &Scope,
            mpsc::Receiver<ReceiveEvent>,
            BodyLimits,
            CancellationToken,
        ) -> Result<Request, ServerError>
        + Send
        + Sync,
>;

/// Process-local map of in-flight requests, keyed by correlation id.
pub struct RequestRegistry {
    factories: DashMap<TransportKind, Factory>,
    in_flight: DashMap<String, RequestHandle>,
    limits: BodyLimits,
}

impl RequestRegistry {
    pub fn new(limits: BodyLimits) -> RequestRegistry {
        let registry = RequestRegistry {
            factories: DashMap::new(),
            in_flight: DashMap::new(),
            limits,
        };
        registry.register_factory(
            TransportKind::Http,
            Arc::new(|id, scope, rx, limits, cancel| {
                Request::from_scope(id, TransportKind::Http, scope, rx, limits, cancel)
            }),
        );
        registry.register_factory(
            TransportKind::WsMsg,
            Arc::new(|id, scope, rx, limits, cancel| {
                Request::from_scope(id, TransportKind::WsMsg, scope, rx, limits, cancel)
            }),
        );
        registry
    }

    /// Register (or replace) the factory for a transport kind.
    pub fn register_factory(&self, kind: TransportKind, factory: Factory) {
        self.factories.insert(kind, factory);
    }

    /// Correlation id for a scope: the `X-Request-ID` header when present
    /// and non-empty, otherwise a freshly generated ULID.
    fn correlation_id(scope: &Scope) -> String {
        scope
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| ulid::Ulid::new().to_string())
    }

    /// Construct and track a request for a transport event.
    ///
    /// An unknown transport kind is fatal for the connection: the caller
    /// closes the transport with a protocol error.
    pub fn create(
        &self,
        kind: TransportKind,
        scope: &Scope,
        receive: mpsc::Receiver<ReceiveEvent>,
        cancel: CancellationToken,
    ) -> Result<RequestHandle, ServerError> {
        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| {
                ServerError::Protocol(format!("no request factory for transport '{}'", kind.as_str()))
            })?
            .clone();
        let id = Self::correlation_id(scope);
        let request = Arc::new(factory(id.clone(), scope, receive, self.limits, cancel)?);
        self.in_flight.insert(id, request.clone());
        Ok(request)
    }

    /// Drop a request from the registry. Idempotent.
    pub fn unregister(&self, id: &str) {
        self.in_flight.remove(id);
    }

    pub fn get(&self, id: &str) -> Option<RequestHandle> {
        self.in_flight.get(id).map(|r| r.clone())
    }

    /// Number of requests currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel_pair;
    use http::Method;

    fn registry() -> RequestRegistry {
        RequestRegistry::new(BodyLimits::default())
    }

    #[tokio::test]
    async fn create_assigns_header_id_when_present() {
        let reg = registry();
        let (in_rx, _in_tx, _s, _o) = channel_pair(1);
        let mut scope = Scope::http(Method::GET, "/x");
        scope.headers.insert("x-request-id", "abc-123".parse().unwrap());

        let request = reg
            .create(TransportKind::Http, &scope, in_rx, CancellationToken::new())
            .unwrap();
        assert_eq!(request.id(), "abc-123");
        assert_eq!(reg.in_flight_count(), 1);

        reg.unregister(request.id());
        assert_eq!(reg.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn create_generates_id_when_header_empty() {
        let reg = registry();
        let (in_rx, _in_tx, _s, _o) = channel_pair(1);
        let mut scope = Scope::http(Method::GET, "/x");
        scope.headers.insert("x-request-id", "".parse().unwrap());

        let request = reg
            .create(TransportKind::Http, &scope, in_rx, CancellationToken::new())
            .unwrap();
        assert!(!request.id().is_empty());
        assert_ne!(request.id(), "");
    }

    #[tokio::test]
    async fn unknown_transport_kind_is_a_protocol_error() {
        let reg = registry();
        reg.factories.remove(&TransportKind::Http);
        let (in_rx, _in_tx, _s, _o) = channel_pair(1);
        let scope = Scope::http(Method::GET, "/x");
        assert!(matches!(
            reg.create(TransportKind::Http, &scope, in_rx, CancellationToken::new()),
            Err(ServerError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn current_request_slot_is_scoped() {
        let reg = registry();
        let (in_rx, _in_tx, _s, _o) = channel_pair(1);
        let scope = Scope::http(Method::GET, "/x");
        let request = reg
            .create(TransportKind::Http, &scope, in_rx, CancellationToken::new())
            .unwrap();

        assert!(current_request().is_none());
        let seen = with_current_request(request.clone(), async {
            current_request().map(|r| r.id().to_string())
        })
        .await;
        assert_eq!(seen.as_deref(), Some(request.id()));
        assert!(current_request().is_none());
    }
}
