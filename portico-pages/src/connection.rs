//! The WebSocket connection driver.
//!
//! One task reads inbound frames and dispatches `rpc.request` messages
//! through the server pipeline (so auth, logging, and error translation
//! apply to them exactly as to HTTP); a writer task drains the page's
//! outbound queue to the socket. Keepalive pings run on the configured
//! interval and an idle peer is closed with the idle-timeout code.
//! Outbound frames for a page are delivered in enqueue order; requests on
//! one connection are processed and answered in arrival order.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use portico_core::{
    Config, MwFuture, ReceiveEvent, Scope, SendEvent, Server, ServerCall, ServerError,
    ServerSettings, TransportKind, TransportSender, WsConnectionHandler,
};
use portico_events::TopicBus;
use tokio_util::sync::CancellationToken;

use crate::page::{Enqueued, OverflowPolicy, Page};
use crate::protocol::{
    RpcMessage, CLOSE_IDLE_TIMEOUT, CLOSE_PROTOCOL_ERROR, CLOSE_SLOW_CONSUMER,
};
use crate::sticky::StickyRouter;

/// Channel of the one-time relocation signal.
pub const RELOCATED_CHANNEL: &str = "session.relocated";
/// Channel of the page-open greeting (carries the page id).
pub const PAGE_OPEN_CHANNEL: &str = "page.open";

/// Tuning for the page layer, from the `ws.*` config surface.
#[derive(Clone, Debug)]
pub struct PagesConfig {
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub queue_depth: usize,
    pub overflow_policy: OverflowPolicy,
    pub slow_consumer_timeout: Duration,
    pub idle_page_ttl: Duration,
}

impl PagesConfig {
    pub fn from_config(config: &Config) -> PagesConfig {
        let settings = ServerSettings::from_config(config);
        PagesConfig {
            ping_interval: settings.ws_ping_interval,
            idle_timeout: settings.ws_idle_timeout,
            queue_depth: settings.ws_send_queue_depth,
            overflow_policy: OverflowPolicy::parse(
                &config.get_or("ws.overflow_policy", "drop_oldest".to_string()),
            ),
            slow_consumer_timeout: Duration::from_secs(
                config.get_or("ws.slow_consumer_timeout", 10),
            ),
            idle_page_ttl: settings.ws_idle_timeout.saturating_mul(2),
        }
    }
}

impl Default for PagesConfig {
    fn default() -> Self {
        PagesConfig::from_config(&Config::empty())
    }
}

/// Handles accepted WebSocket scopes: sticky page placement, the rpc
/// protocol loop, bus fan-out, and keepalive.
pub struct PageConnectionHandler {
    sticky: Arc<StickyRouter>,
    bus: TopicBus,
    config: PagesConfig,
    server: OnceLock<Server>,
}

impl PageConnectionHandler {
    pub fn new(workers: usize, bus: TopicBus, config: PagesConfig) -> Arc<PageConnectionHandler> {
        Arc::new(PageConnectionHandler {
            sticky: Arc::new(StickyRouter::new(
                workers,
                config.idle_page_ttl,
                config.queue_depth,
                config.overflow_policy,
            )),
            bus,
            config,
            server: OnceLock::new(),
        })
    }

    /// Wire the server in after it is built (the builder takes this
    /// handler, so the reference arrives late by construction).
    pub fn attach(&self, server: Server) {
        let _ = self.server.set(server);
    }

    pub fn sticky(&self) -> &Arc<StickyRouter> {
        &self.sticky
    }

    pub fn bus(&self) -> &TopicBus {
        &self.bus
    }

    async fn run(&self, call: &mut ServerCall) -> Result<(), ServerError> {
        let mut receive = call
            .receive
            .take()
            .ok_or_else(|| ServerError::Internal("transport receive already taken".to_string()))?;
        let sender = call.sender.clone();

        match receive.recv().await {
            Some(ReceiveEvent::WsConnect) => {}
            other => {
                return Err(ServerError::Protocol(format!(
                    "expected websocket connect, got {other:?}"
                )))
            }
        }
        sender
            .send(SendEvent::WsAccept { subprotocol: None })
            .await?;

        let identity = call
            .scope
            .auth
            .as_ref()
            .map(|auth| auth.identity.clone())
            .unwrap_or_else(|| format!("anon-{}", ulid::Ulid::new()));
        let presented: Option<String> = form_urlencoded::parse(&call.scope.query_string)
            .find(|(name, _)| name == "page_id")
            .map(|(_, value)| value.into_owned());

        let placement = match self.sticky.place(&identity, presented.as_deref()) {
            Ok(placement) => placement,
            Err(err) => {
                tracing::debug!(error = %err, "rejecting websocket connection");
                sender
                    .send(SendEvent::WsClose {
                        code: CLOSE_PROTOCOL_ERROR,
                        reason: err.kind().to_string(),
                    })
                    .await?;
                return Ok(());
            }
        };
        let page = placement.page.clone();
        tracing::debug!(page_id = %page.id(), %identity, "page connected");

        let conn_cancel = CancellationToken::new();
        let writer = tokio::spawn(writer_loop(
            page.clone(),
            sender.clone(),
            self.config.slow_consumer_timeout,
            conn_cancel.clone(),
        ));

        page.enqueue(
            RpcMessage::Notify {
                channel: PAGE_OPEN_CHANNEL.to_string(),
                payload: serde_json::json!({
                    "page_id": page.id().as_str(),
                    "relocated": placement.relocated,
                }),
            },
            true,
        );
        if placement.relocated {
            page.enqueue(
                RpcMessage::Notify {
                    channel: RELOCATED_CHANNEL.to_string(),
                    payload: serde_json::json!({ "page_id": page.id().as_str() }),
                },
                true,
            );
        }

        let result = self
            .protocol_loop(call, &mut receive, &page, &conn_cancel)
            .await;

        // Eager removal on disconnect; this also closes the outbound
        // queue, which ends the writer.
        self.sticky.evict(page.id());
        conn_cancel.cancel();
        let _ = writer.await;
        result
    }

    async fn protocol_loop(
        &self,
        call: &ServerCall,
        receive: &mut tokio::sync::mpsc::Receiver<ReceiveEvent>,
        page: &Arc<Page>,
        conn_cancel: &CancellationToken,
    ) -> Result<(), ServerError> {
        let sender = call.sender.clone();
        let mut forwarders: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();
        let mut last_seen = tokio::time::Instant::now();
        let mut ping_seq: u64 = 0;
        let mut ping_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let outcome = loop {
            tokio::select! {
                _ = conn_cancel.cancelled() => {
                    let _ = sender
                        .send(SendEvent::WsClose {
                            code: CLOSE_SLOW_CONSUMER,
                            reason: "send queue overflow".to_string(),
                        })
                        .await;
                    break Ok(());
                }
                _ = ping_timer.tick() => {
                    if last_seen.elapsed() > self.config.idle_timeout {
                        let _ = sender
                            .send(SendEvent::WsClose {
                                code: CLOSE_IDLE_TIMEOUT,
                                reason: "keepalive timeout".to_string(),
                            })
                            .await;
                        break Ok(());
                    }
                    ping_seq += 1;
                    page.enqueue(
                        RpcMessage::Ping { id: format!("k{ping_seq}") },
                        true,
                    );
                }
                event = receive.recv() => match event {
                    Some(ReceiveEvent::WsMessage(payload)) => {
                        last_seen = tokio::time::Instant::now();
                        page.touch();
                        match RpcMessage::parse(&payload) {
                            Ok(message) => {
                                self.handle_message(message, call, page, &mut forwarders)
                                    .await;
                            }
                            Err(err) => {
                                // Fatal framing error: protocol close.
                                tracing::debug!(error = %err, "bad frame");
                                let _ = sender
                                    .send(SendEvent::WsClose {
                                        code: CLOSE_PROTOCOL_ERROR,
                                        reason: err.kind().to_string(),
                                    })
                                    .await;
                                break Ok(());
                            }
                        }
                    }
                    Some(ReceiveEvent::WsDisconnect { code }) => {
                        tracing::debug!(code, page_id = %page.id(), "client disconnected");
                        break Ok(());
                    }
                    None => break Ok(()),
                    Some(other) => {
                        break Err(ServerError::Protocol(format!(
                            "unexpected event on websocket: {other:?}"
                        )));
                    }
                },
            }
        };

        for (_, forwarder) in forwarders {
            forwarder.abort();
        }
        outcome
    }

    async fn handle_message(
        &self,
        message: RpcMessage,
        call: &ServerCall,
        page: &Arc<Page>,
        forwarders: &mut HashMap<String, tokio::task::JoinHandle<()>>,
    ) {
        match message {
            RpcMessage::Request {
                id,
                method,
                params,
                ..
            } => {
                // Requests are dispatched (and answered) in arrival order.
                let reply = self.dispatch_rpc(&id, &method, params, &call.scope).await;
                page.enqueue(reply, true);
            }
            RpcMessage::Ping { id } => {
                page.enqueue(RpcMessage::Pong { id }, true);
            }
            RpcMessage::Pong { .. } => {}
            RpcMessage::Subscribe { id, channel } => {
                if !forwarders.contains_key(&channel) {
                    let mut subscription = self.bus.subscribe(&channel).await;
                    let page = page.clone();
                    let cancel_channel = channel.clone();
                    forwarders.insert(
                        channel.clone(),
                        tokio::spawn(async move {
                            while let Some(event) = subscription.recv().await {
                                let delivered = page.enqueue(
                                    RpcMessage::Event {
                                        channel: event.topic.clone(),
                                        payload: event.payload,
                                    },
                                    false,
                                );
                                if matches!(delivered, Enqueued::Closed | Enqueued::Overflow) {
                                    tracing::debug!(
                                        channel = %cancel_channel,
                                        "stopping fan-out for closed or overflowing page"
                                    );
                                    break;
                                }
                            }
                        }),
                    );
                }
                page.enqueue(
                    RpcMessage::Response {
                        id,
                        result: serde_json::json!({ "subscribed": channel }),
                    },
                    true,
                );
            }
            RpcMessage::Unsubscribe { id, channel } => {
                if let Some(forwarder) = forwarders.remove(&channel) {
                    forwarder.abort();
                }
                page.enqueue(
                    RpcMessage::Response {
                        id,
                        result: serde_json::json!({ "unsubscribed": channel }),
                    },
                    true,
                );
            }
            other => {
                tracing::debug!(frame = ?other, "ignoring client frame");
            }
        }
    }

    /// Dispatch one `rpc.request` through the full server pipeline and
    /// fold the response frames back into an rpc message.
    async fn dispatch_rpc(
        &self,
        id: &str,
        method: &str,
        params: serde_json::Value,
        scope: &Scope,
    ) -> RpcMessage {
        let Some(server) = self.server.get() else {
            return RpcMessage::error(id, "internal_error", "server not attached");
        };

        let query_string = {
            let mut query = form_urlencoded::Serializer::new(String::new());
            if let Some(object) = params.as_object() {
                for (name, value) in object {
                    let text = match value {
                        serde_json::Value::Null => continue,
                        serde_json::Value::String(s) => s.clone(),
                        serde_json::Value::Bool(b) => b.to_string(),
                        serde_json::Value::Number(n) => n.to_string(),
                        nested => nested.to_string(),
                    };
                    query.append_pair(name, &text);
                }
            }
            query.finish()
        };

        let mut rpc_scope = Scope::http(Method::POST, &format!("/{}", method.replace('.', "/")));
        rpc_scope.transport = TransportKind::WsMsg;
        rpc_scope.query_string = Bytes::from(query_string);
        rpc_scope.headers = scope.headers.clone();
        rpc_scope.headers.insert(
            "x-request-id",
            id.parse().unwrap_or_else(|_| "invalid".parse().unwrap()),
        );
        rpc_scope.headers.insert(
            http::header::CONTENT_TYPE,
            portico_codec::TYPED_JSON.parse().unwrap(),
        );
        rpc_scope.client = scope.client.clone();

        let (in_rx, in_tx, tx, mut out_rx) = portico_core::channel_pair(4);
        let body = Bytes::from(params.to_string());
        let _ = in_tx
            .send(ReceiveEvent::Body {
                bytes: body,
                more: false,
            })
            .await;
        drop(in_tx);

        let server = server.clone();
        let handle = tokio::spawn(async move { server.handle(rpc_scope, in_rx, tx).await });

        let mut status: u16 = 0;
        let mut body = Vec::new();
        while let Some(event) = out_rx.recv().await {
            match event {
                SendEvent::Start { status: s, .. } => status = s.as_u16(),
                SendEvent::Body { bytes, more } => {
                    body.extend_from_slice(&bytes);
                    if !more {
                        break;
                    }
                }
                _ => break,
            }
        }
        if let Err(err) = handle.await.unwrap_or_else(|e| {
            Err(ServerError::Internal(format!("rpc dispatch task: {e}")))
        }) {
            return RpcMessage::error(id, "internal_error", &err.to_string());
        }

        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&body).into_owned())
        });
        if (200..300).contains(&status) {
            RpcMessage::Response {
                id: id.to_string(),
                result: parsed,
            }
        } else {
            let code = parsed
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("internal_error")
                .to_string();
            RpcMessage::Error {
                id: id.to_string(),
                error: crate::protocol::RpcErrorBody {
                    code,
                    message: parsed
                        .get("message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("request failed")
                        .to_string(),
                    details: serde_json::Value::Null,
                },
            }
        }
    }
}

impl WsConnectionHandler for PageConnectionHandler {
    fn handle_connection<'a>(&'a self, call: &'a mut ServerCall) -> MwFuture<'a> {
        Box::pin(self.run(call))
    }
}

/// Drain the page's outbound queue to the socket, in enqueue order. A
/// peer that cannot keep up past the timeout triggers the slow-consumer
/// close via the connection token.
async fn writer_loop(
    page: Arc<Page>,
    sender: TransportSender,
    slow_timeout: Duration,
    conn_cancel: CancellationToken,
) {
    while let Some(frame) = page.next_outbound().await {
        let payload = match frame.message.encode(false) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "dropping unencodable frame");
                continue;
            }
        };
        let send = sender.send(SendEvent::WsMessage(payload));
        match tokio::time::timeout(slow_timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => break,
            Err(_) => {
                tracing::warn!(page_id = %page.id(), "slow websocket consumer");
                conn_cancel.cancel();
                break;
            }
        }
    }
}
