//! HTTP and WebSocket transport binding.
//!
//! This crate is the sole owner of the axum dependency: it translates
//! between the wire and the core's channel-based transport contract.
//! Every request lands in one fallback service that builds a [`Scope`],
//! bridges the body and response frames over channels, and hands the
//! event to [`Server::handle`]; WebSocket upgrades are driven into the
//! same contract's `Ws*` events.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use http::StatusCode;
use portico_core::{
    channel_pair, ReceiveEvent, Scope, ScopeKind, SendEvent, Server, ServerError, TransportKind,
    TransportSender, WsPayload,
};
use tokio_util::sync::CancellationToken;

/// Shared binding state behind the axum service.
#[derive(Clone)]
struct Binding {
    server: Server,
    connections: Arc<DashMap<IpAddr, usize>>,
    max_connections_per_ip: usize,
}

/// Decrements the per-IP connection count when the request ends.
struct ConnGuard {
    connections: Arc<DashMap<IpAddr, usize>>,
    ip: Option<IpAddr>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        if let Some(ip) = self.ip {
            if let Some(mut count) = self.connections.get_mut(&ip) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

impl Binding {
    /// Count a connection against the per-IP limit; `None` means refused.
    fn admit(&self, ip: Option<IpAddr>) -> Option<ConnGuard> {
        let Some(ip) = ip else {
            return Some(ConnGuard {
                connections: self.connections.clone(),
                ip: None,
            });
        };
        if self.max_connections_per_ip > 0 {
            let mut count = self.connections.entry(ip).or_insert(0);
            if *count >= self.max_connections_per_ip {
                return None;
            }
            *count += 1;
        } else {
            *self.connections.entry(ip).or_insert(0) += 1;
        }
        Some(ConnGuard {
            connections: self.connections.clone(),
            ip: Some(ip),
        })
    }
}

/// Build the axum application for a composed server.
pub fn app(server: Server) -> axum::Router {
    let max = server.settings().max_connections_per_ip;
    let binding = Binding {
        server,
        connections: Arc::new(DashMap::new()),
        max_connections_per_ip: max,
    };
    axum::Router::new()
        .fallback(entry)
        .with_state(binding)
}

/// Scope for an incoming request, before middlewares touch it.
fn scope_from_parts(parts: &http::request::Parts, client: Option<(String, u16)>) -> Scope {
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    let mut scope = Scope::http(parts.method.clone(), &target);
    scope.headers = parts.headers.clone();
    scope.scheme = parts
        .uri
        .scheme_str()
        .unwrap_or("http")
        .to_string();
    scope.client = client;
    scope
}

async fn entry(State(binding): State<Binding>, req: axum::extract::Request) -> Response {
    let client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| (info.0.ip().to_string(), info.0.port()));
    let client_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());

    let Some(guard) = binding.admit(client_ip) else {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            axum::Json(serde_json::json!({ "error": "too_many_connections" })),
        )
            .into_response();
    };

    let (mut parts, body) = req.into_parts();

    // A WebSocket upgrade takes the connection out of the HTTP flow.
    if let Ok(upgrade) = WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        let scope = {
            let mut scope = scope_from_parts(&parts, client);
            scope.kind = ScopeKind::WebSocket {
                subprotocols: Vec::new(),
            };
            scope
        };
        let server = binding.server.clone();
        return upgrade.on_upgrade(move |socket| async move {
            let _guard = guard;
            drive_websocket(server, scope, socket).await;
        });
    }

    let scope = scope_from_parts(&parts, client);
    serve_http(binding.server.clone(), scope, body, guard).await
}

/// Bridge one HTTP exchange: feed body chunks in, stream response frames
/// out. The client going away cancels the in-flight request.
async fn serve_http(server: Server, scope: Scope, body: Body, guard: ConnGuard) -> Response {
    let (in_rx, in_tx, sender, mut out_rx) = channel_pair(8);
    let cancel = CancellationToken::new();

    // Body feeder: wire chunks become `Body` events; a broken read means
    // the client disconnected, which cancels the request.
    let feeder_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut stream = body.into_data_stream();
        loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    if in_tx
                        .send(ReceiveEvent::Body {
                            bytes: chunk,
                            more: true,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Some(Err(_)) => {
                    feeder_cancel.cancel();
                    return;
                }
                None => {
                    let _ = in_tx
                        .send(ReceiveEvent::Body {
                            bytes: Bytes::new(),
                            more: false,
                        })
                        .await;
                    return;
                }
            }
        }
    });

    let handle_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        let _guard = guard;
        if let Err(err) = server
            .handle_with_cancel(scope, in_rx, sender, handle_cancel)
            .await
        {
            tracing::error!(error = %err, "transport event failed");
        }
    });

    // The head frame decides the response; the rest streams through.
    match out_rx.recv().await {
        Some(SendEvent::Start { status, headers }) => {
            let mut builder = Response::builder().status(status);
            for (name, value) in headers {
                builder = builder.header(name, value);
            }
            let stream = tokio_stream::wrappers::ReceiverStream::new(out_rx)
                .take_while(|event| {
                    futures_util::future::ready(matches!(event, SendEvent::Body { .. }))
                })
                .filter_map(|event| async move {
                    match event {
                        SendEvent::Body { bytes, more } => {
                            (!bytes.is_empty() || more).then_some(Ok::<_, ServerError>(bytes))
                        }
                        _ => None,
                    }
                });
            builder
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        _ => {
            // The core never produced a head frame.
            task.abort();
            cancel.cancel();
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Drive an upgraded socket against the core's Ws* event contract.
async fn drive_websocket(server: Server, scope: Scope, socket: WebSocket) {
    let (in_rx, in_tx, sender, mut out_rx) = channel_pair(32);
    let cancel = CancellationToken::new();

    if in_tx.send(ReceiveEvent::WsConnect).await.is_err() {
        return;
    }

    let handle_cancel = cancel.clone();
    let server_task = tokio::spawn(async move {
        if let Err(err) = server
            .handle_with_cancel(scope, in_rx, sender, handle_cancel)
            .await
        {
            tracing::debug!(error = %err, "websocket session ended with error");
        }
    });

    let (mut sink, mut stream) = socket.split();

    // Socket → core.
    let reader_cancel = cancel.clone();
    let reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            let event = match frame {
                Ok(Message::Text(text)) => {
                    ReceiveEvent::WsMessage(WsPayload::Text(text.to_string()))
                }
                Ok(Message::Binary(bytes)) => {
                    ReceiveEvent::WsMessage(WsPayload::Binary(bytes))
                }
                Ok(Message::Close(frame)) => {
                    let code = frame.map(|f| u16::from(f.code)).unwrap_or(1000);
                    let _ = in_tx.send(ReceiveEvent::WsDisconnect { code }).await;
                    break;
                }
                // axum answers pings at the protocol level.
                Ok(_) => continue,
                Err(_) => {
                    let _ = in_tx.send(ReceiveEvent::WsDisconnect { code: 1006 }).await;
                    break;
                }
            };
            if in_tx.send(event).await.is_err() {
                break;
            }
        }
        reader_cancel.cancel();
    });

    // Core → socket. The accept already happened at upgrade time, so the
    // WsAccept frame is consumed silently.
    while let Some(event) = out_rx.recv().await {
        match event {
            SendEvent::WsAccept { .. } => {}
            SendEvent::WsMessage(WsPayload::Text(text)) => {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            SendEvent::WsMessage(WsPayload::Binary(bytes)) => {
                if sink.send(Message::Binary(bytes)).await.is_err() {
                    break;
                }
            }
            SendEvent::WsClose { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: code.into(),
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
            other => {
                tracing::debug!(frame = ?other, "unexpected frame on websocket");
            }
        }
    }

    cancel.cancel();
    reader.abort();
    let _ = server_task.await;
}

/// Run the lifespan startup, serve until a shutdown signal, then run the
/// lifespan shutdown.
pub async fn serve(server: Server) -> Result<(), ServerError> {
    let settings = server.settings().clone();
    let addr = format!("{}:{}", settings.host, settings.port);

    server.lifespan().startup().await?;

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ServerError::Internal(format!("bind {addr}: {e}")))?;
    tracing::info!(%addr, "portico server listening");

    let service = app(server.clone()).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ServerError::Internal(format!("serve: {e}")))?;

    server.lifespan().shutdown().await?;
    tracing::info!("portico server stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl-C or SIGTERM on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl-C");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, starting graceful shutdown");
}
