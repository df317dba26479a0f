//! The ordered middleware pipeline around the dispatcher.
//!
//! Each middleware declares a static order (lower = outer) and a default
//! enablement; construction loads the enabled set from configuration,
//! sorts ascending, and chains them so the lowest order runs first on the
//! way in and last on the way out. A middleware may short-circuit by
//! emitting a response without calling `next`, mutate the scope (auth
//! tags, capabilities, session), or observe the outgoing response.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ServerError;
use crate::transport::{ReceiveEvent, Scope, TransportSender};

/// Standard order slots; applications use 500..=800.
pub mod order {
    pub const ERROR_TRANSLATION: i32 = 100;
    pub const RATE_LIMIT: i32 = 150;
    pub const REQUEST_LOGGING: i32 = 200;
    pub const CORS: i32 = 300;
    pub const AUTHENTICATION: i32 = 400;
    pub const SESSION: i32 = 450;
    pub const COMPRESSION: i32 = 900;
}

pub type MwFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ServerError>> + Send + 'a>>;

/// One transport event travelling through the pipeline.
pub struct ServerCall {
    pub scope: Scope,
    /// Inbound events; taken by the dispatcher when it builds the request.
    pub receive: Option<mpsc::Receiver<ReceiveEvent>>,
    pub sender: TransportSender,
    pub cancel: CancellationToken,
}

impl ServerCall {
    pub fn new(
        scope: Scope,
        receive: mpsc::Receiver<ReceiveEvent>,
        sender: TransportSender,
        cancel: CancellationToken,
    ) -> ServerCall {
        ServerCall {
            scope,
            receive: Some(receive),
            sender,
            cancel,
        }
    }

    /// Emit a complete error response, unless the head already went out.
    pub async fn send_error(&self, err: &ServerError, debug: bool) -> Result<(), ServerError> {
        let mut response = crate::response::Response::new();
        response.set_error(err, debug);
        response
            .emit(&self.sender, None, &self.scope.extra_response_headers, false)
            .await
    }

    /// Emit a complete response produced by a short-circuiting middleware.
    pub async fn send_response(
        &self,
        response: crate::response::Response,
    ) -> Result<(), ServerError> {
        response
            .emit(&self.sender, None, &self.scope.extra_response_headers, false)
            .await
    }
}

/// A wrapper around the dispatcher.
pub trait Middleware: Send + Sync + 'static {
    /// Configuration name (`middleware.<name>` keys address it).
    fn name(&self) -> &'static str;

    /// Pipeline position; lower runs first on entry.
    fn order(&self) -> i32;

    /// Whether the middleware is active without explicit configuration.
    fn default_enabled(&self) -> bool {
        true
    }

    fn handle<'a>(&'a self, call: &'a mut ServerCall, next: Next<'a>) -> MwFuture<'a>;
}

/// The innermost element of every chain.
pub trait Terminal: Send + Sync {
    fn dispatch<'a>(&'a self, call: &'a mut ServerCall) -> MwFuture<'a>;
}

/// Continuation handed to each middleware.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn Terminal,
}

impl<'a> Next<'a> {
    pub async fn run(self, call: &mut ServerCall) -> Result<(), ServerError> {
        match self.chain.split_first() {
            Some((middleware, rest)) => {
                middleware
                    .handle(
                        call,
                        Next {
                            chain: rest,
                            terminal: self.terminal,
                        },
                    )
                    .await
            }
            None => self.terminal.dispatch(call).await,
        }
    }
}

/// An ordered, composable chain terminating in the dispatcher.
pub struct MiddlewarePipeline {
    chain: Vec<Arc<dyn Middleware>>,
    terminal: Arc<dyn Terminal>,
}

impl MiddlewarePipeline {
    /// Build a pipeline from an unordered set of middlewares.
    pub fn new(mut middlewares: Vec<Arc<dyn Middleware>>, terminal: Arc<dyn Terminal>) -> Self {
        middlewares.sort_by_key(|m| m.order());
        MiddlewarePipeline {
            chain: middlewares,
            terminal,
        }
    }

    /// Names in execution order, outermost first.
    pub fn names(&self) -> Vec<&'static str> {
        self.chain.iter().map(|m| m.name()).collect()
    }

    pub async fn run(&self, call: &mut ServerCall) -> Result<(), ServerError> {
        Next {
            chain: &self.chain,
            terminal: &*self.terminal,
        }
        .run(call)
        .await
    }
}

/// Decide enablement from configuration: `middleware.<name>` set to
/// `off`/`false` disables, any other present value enables, absence falls
/// back to the middleware's default.
pub fn enabled_by_config(
    middleware: &dyn Middleware,
    config: &crate::config::Config,
) -> bool {
    let key = format!("middleware.{}", middleware.name());
    match config.get_raw(&key) {
        Some(value) => {
            let text = value.as_display_string().to_ascii_lowercase();
            !(text == "off" || text == "false" || text == "0")
        }
        None => middleware.default_enabled(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel_pair;
    use http::Method;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        order: i32,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }
        fn order(&self) -> i32 {
            self.order
        }
        fn handle<'a>(&'a self, call: &'a mut ServerCall, next: Next<'a>) -> MwFuture<'a> {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("{}:in", self.name));
                let result = next.run(call).await;
                self.log.lock().unwrap().push(format!("{}:out", self.name));
                result
            })
        }
    }

    struct NoopTerminal {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Terminal for NoopTerminal {
        fn dispatch<'a>(&'a self, _call: &'a mut ServerCall) -> MwFuture<'a> {
            Box::pin(async move {
                self.log.lock().unwrap().push("dispatch".to_string());
                Ok(())
            })
        }
    }

    fn call() -> (ServerCall, tokio::sync::mpsc::Receiver<crate::transport::SendEvent>) {
        let (in_rx, _t, sender, out_rx) = channel_pair(1);
        (
            ServerCall::new(
                Scope::http(Method::GET, "/x"),
                in_rx,
                sender,
                CancellationToken::new(),
            ),
            out_rx,
        )
    }

    #[tokio::test]
    async fn lower_order_runs_first_in_and_last_out() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = MiddlewarePipeline::new(
            vec![
                Arc::new(Recorder {
                    name: "inner",
                    order: 900,
                    log: log.clone(),
                }),
                Arc::new(Recorder {
                    name: "outer",
                    order: 100,
                    log: log.clone(),
                }),
            ],
            Arc::new(NoopTerminal { log: log.clone() }),
        );

        let (mut c, _out) = call();
        pipeline.run(&mut c).await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer:in", "inner:in", "dispatch", "inner:out", "outer:out"]
        );
    }

    struct ShortCircuit;

    impl Middleware for ShortCircuit {
        fn name(&self) -> &'static str {
            "short"
        }
        fn order(&self) -> i32 {
            100
        }
        fn handle<'a>(&'a self, call: &'a mut ServerCall, _next: Next<'a>) -> MwFuture<'a> {
            Box::pin(async move {
                let mut response = crate::response::Response::new();
                response
                    .set_result(
                        crate::response::Payload::Text("blocked".into()),
                        crate::response::Metadata::new(),
                        false,
                    )
                    .unwrap();
                call.send_response(response).await
            })
        }
    }

    #[tokio::test]
    async fn short_circuit_skips_inner_layers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = MiddlewarePipeline::new(
            vec![Arc::new(ShortCircuit)],
            Arc::new(NoopTerminal { log: log.clone() }),
        );
        let (mut c, _out) = call();
        pipeline.run(&mut c).await.unwrap();
        assert!(log.lock().unwrap().is_empty());
    }
}
