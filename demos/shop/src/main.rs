//! Demo shop application.
//!
//! Run with `cargo run -p shop-demo`; configuration comes from
//! `portico.yaml` / `PORTICO_*` environment variables in the usual way.

use std::sync::Arc;

use portico::prelude::*;
use portico::ServerSettings;

mod shop;

use shop::ShopApp;

/// Exit codes: 0 clean shutdown, 1 startup failure, 2 configuration
/// error, 130 interrupt.
fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let config = match Config::load("dev") {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return 2;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("runtime error: {err}");
            return 1;
        }
    };

    runtime.block_on(async move {
        // A second interrupt aborts immediately.
        tokio::spawn(async {
            let _ = tokio::signal::ctrl_c().await;
            let _ = tokio::signal::ctrl_c().await;
            std::process::exit(130);
        });

        let bus = TopicBus::new();
        let pages = PageConnectionHandler::new(
            ServerSettings::from_config(&config).workers,
            bus.clone(),
            PagesConfig::from_config(&config),
        );

        let server = match Server::builder(config)
            .mount(Arc::new(ShopApp::new(bus)))
            .ws_handler(pages.clone())
            .build()
        {
            Ok(server) => server,
            Err(err) => {
                eprintln!("startup failure: {err}");
                return 1;
            }
        };
        pages.attach(server.clone());

        match portico::http::serve(server).await {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("startup failure: {err}");
                1
            }
        }
    })
}
