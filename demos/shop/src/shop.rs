//! The shop app: a small catalogue with an authenticated admin corner and
//! an echo endpoint for the page protocol.

use portico::prelude::*;
use portico::events::{topics, TopicBus};
use portico::ServerError;

pub struct ShopApp {
    bus: TopicBus,
}

impl ShopApp {
    pub fn new(bus: TopicBus) -> ShopApp {
        ShopApp { bus }
    }
}

impl RoutingInstance for ShopApp {
    fn routes(&self) -> RouteSet {
        let bus = self.bus.clone();

        RouteSet::new()
            .route(
                Route::handler(
                    "products",
                    Handler::asynchronous(|call| async move {
                        let category =
                            call.args.get_str("category").unwrap_or("all").to_string();
                        tracing::debug!(%category, "listing products");
                        Ok(Outcome::value(serde_json::json!({ "items": [] })))
                    }),
                )
                .arg(ArgSpec::optional(
                    "category",
                    ArgKind::Str,
                    TypedValue::Str("all".into()),
                ))
                .metadata("cache_seconds", serde_json::json!(30)),
            )
            .route(
                Route::subtree("item").child(
                    Route::param(
                        "name",
                        Handler::asynchronous(|call| async move {
                            let name = call.args.get_str("name").unwrap_or_default();
                            Ok(Outcome::value(serde_json::json!({
                                "name": name,
                                "price": "9.50::N",
                            })))
                        }),
                    )
                    .arg(ArgSpec::required("name", ArgKind::Str)),
                ),
            )
            .route(
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
            .route(
                Route::subtree("admin")
                    .auth_tags("admin")
                    .child(
                        Route::handler(
                            "restock",
                            Handler::asynchronous(move |call| {
                                let bus = bus.clone();
                                async move {
                                    let item = call
                                        .args
                                        .get_str("item")
                                        .unwrap_or_default()
                                        .to_string();
                                    bus.publish(
                                        topics::DB_EVENT,
                                        serde_json::json!({ "table": "stock", "item": item }),
                                    )
                                    .await;
                                    Ok(Outcome::value(serde_json::json!({ "restocked": item })))
                                }
                            }),
                        )
                        .arg(ArgSpec::required("item", ArgKind::Str)),
                    )
                    .child(Route::handler(
                        "report",
                        Handler::blocking(|_call| {
                            // Stands in for a sync reporting library call.
                            std::thread::sleep(std::time::Duration::from_millis(10));
                            Ok(Outcome::value(serde_json::json!({ "rows": 0 })))
                        }),
                    )),
            )
    }
}

impl AppInstance for ShopApp {
    fn name(&self) -> &str {
        "shop"
    }

    fn on_startup(&self) -> portico::routes::BoxFuture<Result<(), ServerError>> {
        Box::pin(async {
            tracing::info!("shop app ready");
            Ok(())
        })
    }
}
