//! End-to-end dispatch over the channel transport contract: pipeline →
//! dispatcher → router → handler → response frames.

use std::sync::Arc;

use http::{Method, StatusCode};
use portico_codec::TypedValue;
use portico_core::{
    channel_pair, AppInstance, ArgKind, ArgSpec, Config, Handler, Outcome, ReceiveEvent, Route,
    RouteSet, RoutingInstance, Scope, SendEvent, Server,
};

struct ShopApp;

impl RoutingInstance for ShopApp {
    fn routes(&self) -> RouteSet {
        RouteSet::new()
            .route(
                Route::handler(
                    "products",
                    Handler::asynchronous(|call| async move {
                        let category = call.args.get_str("category").unwrap_or("all").to_string();
                        let _ = category;
                        Ok(Outcome::value(serde_json::json!({ "items": [] })))
                    }),
                )
                .arg(ArgSpec::optional(
                    "category",
                    ArgKind::Str,
                    TypedValue::Str("all".into()),
                )),
            )
            .route(
                Route::handler(
                    "report",
                    Handler::blocking(|_call| Ok(Outcome::value(serde_json::json!({ "rows": 3 })))),
                ),
            )
            .route(
                Route::subtree("admin")
                    .auth_tags("admin")
                    .child(Route::handler(
                        "stats",
                        Handler::asynchronous(|_call| async move {
                            Ok(Outcome::value(serde_json::json!({ "ok": true })))
                        }),
                    )),
            )
            .route(
                Route::handler(
                    "page",
                    Handler::asynchronous(|_call| async move {
                        let mut meta = portico_core::Metadata::new();
                        meta.insert("media_type".into(), serde_json::json!("text/html"));
                        Ok(Outcome::with_metadata(
                            portico_core::Payload::Text("<h1>hi</h1>".into()),
                            meta,
                        ))
                    }),
                ),
            )
    }
}

impl AppInstance for ShopApp {
    fn name(&self) -> &str {
        "shop"
    }
}

const SECRET: &[u8] = b"test-secret";

fn test_server() -> Server {
    let mut config = Config::empty();
    config.set(
        "auth.jwt_secret",
        portico_core::config::ConfigValue::String("test-secret".to_string()),
    );
    config.set(
        "limits.max_body_bytes",
        portico_core::config::ConfigValue::Int(1024),
    );
    Server::builder(config)
        .mount(Arc::new(ShopApp))
        .build()
        .unwrap()
}

async fn started_server() -> Server {
    let server = test_server();
    server.lifespan().startup().await.unwrap();
    server
}

struct Reply {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

/// Drive one request through the server and collect the response frames.
async fn perform(server: &Server, scope: Scope, body: Option<&[u8]>) -> Reply {
    let (in_rx, in_tx, sender, mut out_rx) = channel_pair(8);
    if let Some(bytes) = body {
        in_tx
            .send(ReceiveEvent::Body {
                bytes: bytes::Bytes::copy_from_slice(bytes),
                more: false,
            })
            .await
            .unwrap();
    }
    server.handle(scope, in_rx, sender).await.unwrap();

    let mut status = StatusCode::IM_A_TEAPOT;
    let mut headers = Vec::new();
    let mut body = Vec::new();
    while let Some(event) = out_rx.recv().await {
        match event {
            SendEvent::Start {
                status: s,
                headers: h,
            } => {
                status = s;
                headers = h;
            }
            SendEvent::Body { bytes, more } => {
                body.extend_from_slice(&bytes);
                if !more {
                    break;
                }
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    Reply {
        status,
        headers,
        body,
    }
}

fn get(target: &str) -> Scope {
    Scope::http(Method::GET, target)
}

fn with_header(mut scope: Scope, name: &str, value: &str) -> Scope {
    scope.headers.append(
        http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
        value.parse().unwrap(),
    );
    scope
}

fn bearer(scope: Scope, tags: &[&str]) -> Scope {
    let backend = portico_core::JwtAuthBackend::new(SECRET);
    let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
    let token = backend.mint("tester", &tags, 60).unwrap();
    with_header(scope, "authorization", &format!("Bearer {token}"))
}

#[tokio::test]
async fn products_returns_json_and_echoes_request_id() {
    let server = started_server().await;
    let scope = with_header(
        get("/shop/products?category=books"),
        "x-request-id",
        "req-77",
    );
    let reply = perform(&server, scope, None).await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json(), serde_json::json!({ "items": [] }));
    assert_eq!(reply.header("content-type"), Some("application/json"));
    assert_eq!(reply.header("x-request-id"), Some("req-77"));

    // The in-flight map is empty again.
    assert_eq!(server.registry().in_flight_count(), 0);
    server.lifespan().shutdown().await.unwrap();
}

#[tokio::test]
async fn auth_tag_expression_gates_the_admin_subtree() {
    let server = started_server().await;

    let reply = perform(&server, get("/shop/admin/stats"), None).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(reply.json()["error"], "not_authenticated");

    let reply = perform(&server, bearer(get("/shop/admin/stats"), &["user"]), None).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(reply.json()["error"], "not_authorized");

    let reply = perform(
        &server,
        bearer(get("/shop/admin/stats"), &["admin", "user"]),
        None,
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    server.lifespan().shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_path_is_404_json() {
    let server = started_server().await;
    let reply = perform(&server, get("/nowhere/at/all"), None).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.json(), serde_json::json!({ "error": "not_found" }));
    server.lifespan().shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_query_parameter_is_400() {
    let server = started_server().await;
    let reply = perform(&server, get("/shop/products?bogus=1"), None).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["error"], "validation_error");
    server.lifespan().shutdown().await.unwrap();
}

#[tokio::test]
async fn oversized_declared_body_is_413_without_handler_run() {
    let server = started_server().await;
    let scope = with_header(get("/shop/products"), "content-length", "4096");
    let reply = perform(&server, scope, None).await;
    assert_eq!(reply.status, StatusCode::PAYLOAD_TOO_LARGE);
    server.lifespan().shutdown().await.unwrap();
}

#[tokio::test]
async fn blocking_handler_runs_on_the_pool_after_startup() {
    let server = started_server().await;
    let reply = perform(&server, get("/shop/report"), None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json(), serde_json::json!({ "rows": 3 }));
    server.lifespan().shutdown().await.unwrap();
}

#[tokio::test]
async fn blocking_handler_before_startup_is_503() {
    let server = test_server();
    let reply = perform(&server, get("/shop/report"), None).await;
    assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn handler_metadata_override_wins_media_type() {
    let server = started_server().await;
    let reply = perform(&server, get("/shop/page"), None).await;
    assert_eq!(reply.header("content-type"), Some("text/html"));
    assert_eq!(reply.body, b"<h1>hi</h1>");
    server.lifespan().shutdown().await.unwrap();
}

#[tokio::test]
async fn typed_request_gets_typed_response() {
    let server = started_server().await;
    let scope = with_header(
        get("/shop/products"),
        "accept",
        "application/vnd.portico+json",
    );
    let reply = perform(&server, scope, None).await;
    assert_eq!(
        reply.header("content-type"),
        Some("application/vnd.portico+json")
    );
    server.lifespan().shutdown().await.unwrap();
}

#[tokio::test]
async fn lifespan_acks_startup_and_shutdown() {
    let server = test_server();
    let (in_rx, in_tx, sender, mut out_rx) = channel_pair(4);
    in_tx.send(ReceiveEvent::Startup).await.unwrap();
    in_tx.send(ReceiveEvent::Shutdown).await.unwrap();
    server
        .handle(Scope::lifespan(), in_rx, sender)
        .await
        .unwrap();

    assert!(matches!(
        out_rx.recv().await,
        Some(SendEvent::StartupComplete)
    ));
    assert!(matches!(
        out_rx.recv().await,
        Some(SendEvent::ShutdownComplete)
    ));
}

#[tokio::test]
async fn openapi_endpoint_lists_mounted_routes() {
    let server = started_server().await;
    let reply = perform(&server, get("/_server/_openapi"), None).await;
    assert_eq!(reply.status, StatusCode::OK);
    let doc = reply.json();
    assert_eq!(doc["openapi"], "3.0.3");
    assert!(doc["paths"].get("/shop/products").is_some());
    server.lifespan().shutdown().await.unwrap();
}

struct GreeterApp {
    name: String,
    greeting: String,
}

impl RoutingInstance for GreeterApp {
    fn routes(&self) -> RouteSet {
        let greeting = self.greeting.clone();
        RouteSet::new().route(Route::handler(
            "hello",
            Handler::asynchronous(move |_call| {
                let greeting = greeting.clone();
                async move { Ok(Outcome::value(serde_json::json!({ "greeting": greeting }))) }
            }),
        ))
    }
}

impl AppInstance for GreeterApp {
    fn name(&self) -> &str {
        &self.name
    }
}

#[tokio::test]
async fn apps_mount_from_config_through_registered_factories() {
    let config = Config::from_yaml_str(
        "apps:\n  greeter:\n    module: greeter\n    greeting: hallo\n",
        "test",
    )
    .unwrap();
    let server = Server::builder(config)
        .register_app_factory(
            "greeter",
            Arc::new(|name, config| {
                Ok(Arc::new(GreeterApp {
                    name: name.to_string(),
                    greeting: config.get_or(
                        &format!("apps.{name}.greeting"),
                        "hello".to_string(),
                    ),
                }))
            }),
        )
        .build()
        .unwrap();
    server.lifespan().startup().await.unwrap();

    let reply = perform(&server, get("/greeter/hello"), None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json(), serde_json::json!({ "greeting": "hallo" }));
    server.lifespan().shutdown().await.unwrap();
}

#[tokio::test]
async fn create_jwt_requires_elevated_tags() {
    let server = started_server().await;

    let reply = perform(&server, get("/_server/_create_jwt?sub=u1"), None).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);

    let scope = bearer(get("/_server/_create_jwt?sub=u1&tags=user"), &["admin"]);
    let reply = perform(&server, scope, None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(reply.json()["token"].as_str().is_some());
    server.lifespan().shutdown().await.unwrap();
}
