//! Protocol-level tests: a simulated WebSocket session against a running
//! server with the page layer attached.

use std::sync::Arc;
use std::time::Duration;

use http::Method;
use portico_codec::TypedValue;
use portico_core::{
    channel_pair, AppInstance, ArgKind, ArgSpec, Config, Handler, Outcome, ReceiveEvent, Route,
    RouteSet, RoutingInstance, Scope, ScopeKind, SendEvent, Server, WsPayload,
};
use portico_events::TopicBus;
use portico_pages::{PageConnectionHandler, PagesConfig, RpcMessage, PAGE_OPEN_CHANNEL};
use tokio::sync::mpsc;

struct EchoApp;

impl RoutingInstance for EchoApp {
    fn routes(&self) -> RouteSet {
        RouteSet::new().route(
            Route::handler(
                "echo",
                Handler::asynchronous(|call| async move {
                    let msg = call.args.get_str("msg").unwrap_or_default().to_string();
                    Ok(Outcome::value(serde_json::json!({ "msg": msg })))
                }),
            )
            .arg(ArgSpec::optional(
                "msg",
                ArgKind::Str,
                TypedValue::Str(String::new()),
            )),
        )
    }
}

impl AppInstance for EchoApp {
    fn name(&self) -> &str {
        "shop"
    }
}

struct Session {
    in_tx: mpsc::Sender<ReceiveEvent>,
    out_rx: mpsc::Receiver<SendEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl Session {
    async fn send(&self, message: &RpcMessage) {
        let payload = message.encode(false).unwrap();
        self.in_tx
            .send(ReceiveEvent::WsMessage(payload))
            .await
            .unwrap();
    }

    /// Next rpc message, skipping non-message frames.
    async fn recv(&mut self) -> RpcMessage {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), self.out_rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("connection closed");
            match event {
                SendEvent::WsMessage(payload) => return RpcMessage::parse(&payload).unwrap(),
                SendEvent::WsAccept { .. } => continue,
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    async fn disconnect(self) {
        let _ = self
            .in_tx
            .send(ReceiveEvent::WsDisconnect { code: 1000 })
            .await;
        let _ = tokio::time::timeout(Duration::from_secs(2), self.task).await;
    }
}

async fn open_session(server: &Server) -> Session {
    let (in_rx, in_tx, sender, out_rx) = channel_pair(16);
    let mut scope = Scope::http(Method::GET, "/ws");
    scope.kind = ScopeKind::WebSocket {
        subprotocols: vec![],
    };
    in_tx.send(ReceiveEvent::WsConnect).await.unwrap();

    let server = server.clone();
    let task = tokio::spawn(async move {
        let _ = server.handle(scope, in_rx, sender).await;
    });
    Session {
        in_tx,
        out_rx,
        task,
    }
}

async fn test_stack() -> (Server, Arc<PageConnectionHandler>, TopicBus) {
    let bus = TopicBus::new();
    let mut pages = PagesConfig::default();
    pages.ping_interval = Duration::from_secs(30);
    pages.idle_timeout = Duration::from_secs(60);
    let handler = PageConnectionHandler::new(4, bus.clone(), pages);

    let server = Server::builder(Config::empty())
        .mount(Arc::new(EchoApp))
        .ws_handler(handler.clone())
        .build()
        .unwrap();
    handler.attach(server.clone());
    server.lifespan().startup().await.unwrap();
    (server, handler, bus)
}

#[tokio::test]
async fn echo_request_gets_response_with_same_id() {
    let (server, _handler, _bus) = test_stack().await;
    let mut session = open_session(&server).await;

    // Greeting first.
    match session.recv().await {
        RpcMessage::Notify { channel, payload } => {
            assert_eq!(channel, PAGE_OPEN_CHANNEL);
            assert!(payload["page_id"].as_str().unwrap().contains("|p"));
            assert_eq!(payload["relocated"], false);
        }
        other => panic!("expected greeting, got {other:?}"),
    }

    session
        .send(&RpcMessage::Request {
            id: "r1".to_string(),
            method: "shop.echo".to_string(),
            params: serde_json::json!({ "msg": "hi" }),
            meta: serde_json::Value::Null,
        })
        .await;

    match session.recv().await {
        RpcMessage::Response { id, result } => {
            assert_eq!(id, "r1");
            assert_eq!(result, serde_json::json!({ "msg": "hi" }));
        }
        other => panic!("expected response, got {other:?}"),
    }

    session.disconnect().await;
    server.lifespan().shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_method_yields_rpc_error_with_same_id() {
    let (server, _handler, _bus) = test_stack().await;
    let mut session = open_session(&server).await;
    session.recv().await; // greeting

    session
        .send(&RpcMessage::Request {
            id: "r9".to_string(),
            method: "shop.nothing".to_string(),
            params: serde_json::json!({}),
            meta: serde_json::Value::Null,
        })
        .await;

    match session.recv().await {
        RpcMessage::Error { id, error } => {
            assert_eq!(id, "r9");
            assert_eq!(error.code, "not_found");
        }
        other => panic!("expected error, got {other:?}"),
    }
    session.disconnect().await;
    server.lifespan().shutdown().await.unwrap();
}

#[tokio::test]
async fn ping_is_answered_with_pong_of_same_id() {
    let (server, _handler, _bus) = test_stack().await;
    let mut session = open_session(&server).await;
    session.recv().await; // greeting

    session
        .send(&RpcMessage::Ping {
            id: "p7".to_string(),
        })
        .await;
    match session.recv().await {
        RpcMessage::Pong { id } => assert_eq!(id, "p7"),
        other => panic!("expected pong, got {other:?}"),
    }
    session.disconnect().await;
    server.lifespan().shutdown().await.unwrap();
}

#[tokio::test]
async fn subscribe_receives_bus_events_until_disconnect() {
    let (server, _handler, bus) = test_stack().await;
    let mut session = open_session(&server).await;
    session.recv().await; // greeting

    session
        .send(&RpcMessage::Subscribe {
            id: "s1".to_string(),
            channel: "dbevent".to_string(),
        })
        .await;
    match session.recv().await {
        RpcMessage::Response { id, .. } => assert_eq!(id, "s1"),
        other => panic!("expected subscribe ack, got {other:?}"),
    }

    bus.publish("dbevent", serde_json::json!({ "table": "orders" }))
        .await;
    match session.recv().await {
        RpcMessage::Event { channel, payload } => {
            assert_eq!(channel, "dbevent");
            assert_eq!(payload["table"], "orders");
        }
        other => panic!("expected event, got {other:?}"),
    }

    session.disconnect().await;

    // The page is gone and its forwarder no longer listens.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        bus.publish("dbevent", serde_json::json!({ "table": "users" }))
            .await,
        0
    );
    server.lifespan().shutdown().await.unwrap();
}

#[tokio::test]
async fn malformed_frame_closes_with_protocol_code() {
    let (server, _handler, _bus) = test_stack().await;
    let mut session = open_session(&server).await;
    session.recv().await; // greeting

    session
        .in_tx
        .send(ReceiveEvent::WsMessage(WsPayload::Text(
            "not a frame".to_string(),
        )))
        .await
        .unwrap();

    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), session.out_rx.recv())
            .await
            .expect("timed out")
            .expect("closed");
        if let SendEvent::WsClose { code, .. } = event {
            assert_eq!(code, 1002);
            break;
        }
    }
    server.lifespan().shutdown().await.unwrap();
}
