//! Ordered startup and shutdown of the core resources and mounted apps.
//!
//! Startup: configuration is already frozen when the manager exists, so
//! the sequence here is logger binding, execution pools, then each app's
//! `on_startup` in mount order. Any failure aborts further startup and is
//! surfaced as a `startup.failed` acknowledgment; apps that never started
//! are never shut down. Shutdown runs in reverse and continues past
//! individual app failures. Both directions are idempotent under
//! duplicate transport signals.

use std::sync::{Arc, Mutex, Once};

use portico_executor::ExecutionSubsystem;

use crate::error::ServerError;
use crate::server::AppInstance;

static LOGGER: Once = Once::new();

/// Bind the global tracing subscriber once per process.
fn bind_logger() {
    LOGGER.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .try_init();
    });
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Started; payload is how many apps completed `on_startup`.
    Started,
    Stopped,
}

pub struct LifespanManager {
    executor: Arc<ExecutionSubsystem>,
    apps: Vec<Arc<dyn AppInstance>>,
    state: Mutex<(Phase, usize)>,
}

impl LifespanManager {
    pub fn new(
        executor: Arc<ExecutionSubsystem>,
        apps: Vec<Arc<dyn AppInstance>>,
    ) -> LifespanManager {
        LifespanManager {
            executor,
            apps,
            state: Mutex::new((Phase::Idle, 0)),
        }
    }

    /// Run the startup sequence. A repeated signal is a no-op.
    pub async fn startup(&self) -> Result<(), ServerError> {
        {
            let state = self.state.lock().unwrap();
            if state.0 == Phase::Started {
                return Ok(());
            }
        }

        bind_logger();
        self.executor.start_all();

        let mut started = 0usize;
        for app in &self.apps {
            match app.on_startup().await {
                Ok(()) => started += 1,
                Err(err) => {
                    // Record how far we got so shutdown only visits
                    // started apps, then surface the failure.
                    *self.state.lock().unwrap() = (Phase::Started, started);
                    tracing::error!(app = app.name(), error = %err, "app startup failed");
                    return Err(ServerError::Internal(format!(
                        "startup of app '{}' failed: {err}",
                        app.name()
                    )));
                }
            }
        }

        *self.state.lock().unwrap() = (Phase::Started, started);
        tracing::info!(apps = started, "server started");
        Ok(())
    }

    /// Run the shutdown sequence in reverse order. A repeated signal, or a
    /// shutdown without startup, is a no-op.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        let started = {
            let mut state = self.state.lock().unwrap();
            if state.0 != Phase::Started {
                return Ok(());
            }
            let started = state.1;
            *state = (Phase::Stopped, 0);
            started
        };

        // Apps in reverse mount order, continuing past failures.
        for app in self.apps.iter().take(started).rev() {
            if let Err(err) = app.on_shutdown().await {
                tracing::error!(app = app.name(), error = %err, "app shutdown failed");
            }
        }

        // Pools last: drain, no forced abort.
        self.executor.stop_all(false);
        tracing::info!("server stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().unwrap().0 == Phase::Started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::{RouteSet, RoutingInstance};
    use portico_executor::ExecutorConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        name: &'static str,
        fail_startup: bool,
        started: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
    }

    impl RoutingInstance for Probe {
        fn routes(&self) -> RouteSet {
            RouteSet::new()
        }
    }

    impl AppInstance for Probe {
        fn name(&self) -> &str {
            self.name
        }

        fn on_startup(&self) -> crate::routes::BoxFuture<Result<(), ServerError>> {
            let fail = self.fail_startup;
            let counter = self.started.clone();
            Box::pin(async move {
                if fail {
                    return Err(ServerError::Internal("nope".to_string()));
                }
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }

        fn on_shutdown(&self) -> crate::routes::BoxFuture<Result<(), ServerError>> {
            let counter = self.stopped.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    fn probe(
        name: &'static str,
        fail: bool,
        started: &Arc<AtomicUsize>,
        stopped: &Arc<AtomicUsize>,
    ) -> Arc<dyn AppInstance> {
        Arc::new(Probe {
            name,
            fail_startup: fail,
            started: started.clone(),
            stopped: stopped.clone(),
        })
    }

    #[tokio::test]
    async fn startup_and_shutdown_are_idempotent() {
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let manager = LifespanManager::new(
            Arc::new(ExecutionSubsystem::new(ExecutorConfig::default())),
            vec![probe("a", false, &started, &stopped)],
        );

        manager.startup().await.unwrap();
        manager.startup().await.unwrap();
        assert_eq!(started.load(Ordering::SeqCst), 1);

        manager.shutdown().await.unwrap();
        manager.shutdown().await.unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_startup_skips_unstarted_apps_on_shutdown() {
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let manager = LifespanManager::new(
            Arc::new(ExecutionSubsystem::new(ExecutorConfig::default())),
            vec![
                probe("ok", false, &started, &stopped),
                probe("bad", true, &started, &stopped),
                probe("never", false, &started, &stopped),
            ],
        );

        assert!(manager.startup().await.is_err());
        assert_eq!(started.load(Ordering::SeqCst), 1);

        manager.shutdown().await.unwrap();
        // Only the app that started gets shut down.
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_without_startup_is_a_no_op() {
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let manager = LifespanManager::new(
            Arc::new(ExecutionSubsystem::new(ExecutorConfig::default())),
            vec![probe("a", false, &started, &stopped)],
        );
        manager.shutdown().await.unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 0);
    }
}
