//! The dispatcher: bridges transport events to the router and executes
//! handlers.
//!
//! For each HTTP event it creates the request, installs it as the current
//! request, resolves a node, invokes the handler (on the blocking pool for
//! sync handlers), merges per-call metadata over node metadata, emits the
//! response, and unregisters the request in a guaranteed-cleanup step.
//! WebSocket connection scopes are delegated to the configured connection
//! handler after the pipeline has run (so auth applies to them too).

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use portico_executor::ExecutionSubsystem;

use crate::error::ServerError;
use crate::middleware::{MwFuture, ServerCall, Terminal};
use crate::registry::{with_current_request, RequestRegistry};
use crate::request::RequestHandle;
use crate::response::{Metadata, Payload, Response};
use crate::router::{ResolveContext, Router};
use crate::routes::{Handler, HandlerCall, Outcome};
use crate::transport::{ScopeKind, TransportSender};

/// Slot for the page/WS layer; the core treats it as an opaque collaborator.
pub trait WsConnectionHandler: Send + Sync + 'static {
    fn handle_connection<'a>(&'a self, call: &'a mut ServerCall) -> MwFuture<'a>;
}

pub struct Dispatcher {
    registry: Arc<RequestRegistry>,
    router: Arc<Router>,
    executor: Arc<ExecutionSubsystem>,
    ws: Option<Arc<dyn WsConnectionHandler>>,
    max_body_bytes: usize,
    request_deadline: Option<Duration>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<RequestRegistry>,
        router: Arc<Router>,
        executor: Arc<ExecutionSubsystem>,
        ws: Option<Arc<dyn WsConnectionHandler>>,
        max_body_bytes: usize,
        request_deadline: Option<Duration>,
    ) -> Dispatcher {
        Dispatcher {
            registry,
            router,
            executor,
            ws,
            max_body_bytes,
            request_deadline,
        }
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    async fn dispatch_http(&self, call: &mut ServerCall) -> Result<(), ServerError> {
        // Declared-length check before any request state exists: an
        // oversized body gets 413 and the handler never runs.
        if let Some(length) = call
            .scope
            .headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok())
        {
            if length > self.max_body_bytes {
                let mut response = Response::new();
                response.set_result(
                    Payload::Value(portico_codec::TypedValue::Object(vec![(
                        "error".to_string(),
                        portico_codec::TypedValue::Str("payload_too_large".to_string()),
                    )])),
                    Metadata::new(),
                    false,
                )?;
                response.set_status(StatusCode::PAYLOAD_TOO_LARGE);
                return call.send_response(response).await;
            }
        }

        let receive = call
            .receive
            .take()
            .ok_or_else(|| ServerError::Internal("transport receive already taken".to_string()))?;
        let request = self.registry.create(
            call.scope.transport,
            &call.scope,
            receive,
            call.cancel.child_token(),
        )?;

        let sender = call.sender.clone();
        let outcome = with_current_request(
            request.clone(),
            self.run_request(request.clone(), sender),
        )
        .await;

        // Exactly one unregister per created request, on every path.
        self.registry.unregister(request.id());
        outcome
    }

    /// Resolve, invoke, and emit for one request.
    async fn run_request(
        &self,
        request: RequestHandle,
        sender: TransportSender,
    ) -> Result<(), ServerError> {
        let auth_tags = request.auth_tags();
        let env_capabilities = request.env_capabilities();
        let ctx = ResolveContext {
            auth_tags: &auth_tags,
            env_capabilities: &env_capabilities,
            query: request.query(),
            typed: request.typed(),
            request: Some(&request),
        };
        let resolved = self.router.resolve(request.path(), &ctx)?;

        let call = HandlerCall {
            request: request.clone(),
            args: resolved.bound_args,
        };
        let outcome = self.invoke(resolved.handler, call, &request).await?;

        let mut metadata = resolved.metadata;
        if let Some(overrides) = outcome.metadata {
            metadata.extend(overrides);
        }

        request.with_response(|response| {
            response.set_result(outcome.payload, metadata, request.typed())
        })??;

        let response = request.take_response()?;
        response
            .emit(
                &sender,
                Some(request.id()),
                request.extra_response_headers(),
                request.allow_compression(),
            )
            .await
    }

    /// Invoke per the handler's calling convention, racing the request's
    /// cancellation token and the optional per-request deadline.
    async fn invoke(
        &self,
        handler: Handler,
        call: HandlerCall,
        request: &RequestHandle,
    ) -> Result<Outcome, ServerError> {
        let work = async {
            match handler {
                Handler::Async(f) => f(call).await,
                Handler::Blocking(f) => {
                    // Sync handlers never run on the request task. The call
                    // data crosses the pool boundary explicitly; the
                    // current-request slot does not.
                    self.executor
                        .blocking()
                        .run(move || f(call))
                        .await
                        .map_err(ServerError::from)?
                }
            }
        };

        let cancelled = request.cancellation().cancelled();
        match self.request_deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = cancelled => Err(ServerError::Cancelled("client disconnected".to_string())),
                    result = tokio::time::timeout(deadline, work) => match result {
                        Ok(outcome) => outcome,
                        Err(_) => Err(ServerError::Timeout("request deadline exceeded".to_string())),
                    },
                }
            }
            None => {
                tokio::select! {
                    _ = cancelled => Err(ServerError::Cancelled("client disconnected".to_string())),
                    outcome = work => outcome,
                }
            }
        }
    }
}

impl Terminal for Dispatcher {
    fn dispatch<'a>(&'a self, call: &'a mut ServerCall) -> MwFuture<'a> {
        Box::pin(async move {
            match call.scope.kind {
                ScopeKind::Http => self.dispatch_http(call).await,
                ScopeKind::WebSocket { .. } => match &self.ws {
                    Some(handler) => handler.handle_connection(call).await,
                    None => {
                        call.sender
                            .send(crate::transport::SendEvent::WsClose {
                                code: 1003,
                                reason: "websocket endpoint not configured".to_string(),
                            })
                            .await
                    }
                },
                ScopeKind::Lifespan => Err(ServerError::Protocol(
                    "lifespan event reached the dispatcher".to_string(),
                )),
            }
        })
    }
}
