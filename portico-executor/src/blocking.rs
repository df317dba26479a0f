//! Worker-thread pool for synchronous work.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, Semaphore, TryAcquireError};

use crate::{ExecutorError, QueuePolicy};

type Job = Box<dyn FnOnce() + Send>;

struct Running {
    tx: crossbeam_channel::Sender<Job>,
    /// Kept for draining the queue on `stop(cancel_pending = true)`.
    rx: crossbeam_channel::Receiver<Job>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

/// N worker threads behind a depth-bounded queue.
///
/// `run` schedules a closure and resolves when the worker completes it;
/// panics surface as [`ExecutorError::Panicked`]. Calls before `start`
/// fail with `NotStarted`.
pub struct BlockingPool {
    label: &'static str,
    threads: usize,
    policy: QueuePolicy,
    /// Bounds queued-plus-running work; a permit is held from submission
    /// until the worker finishes the job.
    slots: Arc<Semaphore>,
    state: Mutex<Option<Running>>,
}

impl BlockingPool {
    pub fn new(
        label: &'static str,
        threads: usize,
        queue_depth: usize,
        policy: QueuePolicy,
    ) -> BlockingPool {
        BlockingPool {
            label,
            threads: threads.max(1),
            policy,
            slots: Arc::new(Semaphore::new(queue_depth.max(1))),
            state: Mutex::new(None),
        }
    }

    /// Spawn the worker threads. Idempotent.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return;
        }
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let handles = (0..self.threads)
            .map(|i| {
                let rx = rx.clone();
                let label = self.label;
                std::thread::Builder::new()
                    .name(format!("portico-{label}-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn pool worker thread")
            })
            .collect();
        *state = Some(Running { tx, rx, handles });
        tracing::debug!(pool = self.label, threads = self.threads, "pool started");
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }

    /// Stop the pool. Queued jobs are drained unless `cancel_pending`, in
    /// which case they are dropped (their submitters see `Cancelled`).
    pub fn stop(&self, cancel_pending: bool) {
        let running = self.state.lock().unwrap().take();
        let Some(Running { tx, rx, handles }) = running else {
            return;
        };
        if cancel_pending {
            // Dropping a queued job drops its result sender, which
            // resolves the submitter with Cancelled.
            while rx.try_recv().is_ok() {}
        }
        drop(tx);
        drop(rx);
        for handle in handles {
            let _ = handle.join();
        }
        tracing::debug!(pool = self.label, "pool stopped");
    }

    fn enqueue(&self, job: Job) -> Result<(), ExecutorError> {
        let state = self.state.lock().unwrap();
        match state.as_ref() {
            Some(running) => running
                .tx
                .send(job)
                .map_err(|_| ExecutorError::ShuttingDown(self.label.to_string())),
            None => Err(ExecutorError::NotStarted(self.label.to_string())),
        }
    }

    async fn acquire_slot(&self) -> Result<tokio::sync::OwnedSemaphorePermit, ExecutorError> {
        match self.policy {
            QueuePolicy::Block => self
                .slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ExecutorError::ShuttingDown(self.label.to_string())),
            QueuePolicy::FailFast => {
                self.slots
                    .clone()
                    .try_acquire_owned()
                    .map_err(|err| match err {
                        TryAcquireError::NoPermits => {
                            ExecutorError::Overloaded(format!("{} queue is full", self.label))
                        }
                        TryAcquireError::Closed => {
                            ExecutorError::ShuttingDown(self.label.to_string())
                        }
                    })
            }
        }
    }

    /// Schedule `f` and wait for its result; the exception (panic) of the
    /// closure propagates as an error, never as a worker crash.
    pub async fn run<F, R>(&self, f: F) -> Result<R, ExecutorError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if !self.is_started() {
            return Err(ExecutorError::NotStarted(self.label.to_string()));
        }
        let permit = self.acquire_slot().await?;
        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(f));
            let _ = result_tx.send(outcome);
            drop(permit);
        });
        self.enqueue(job)?;

        match result_rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(panic)) => Err(ExecutorError::Panicked(panic_message(&panic))),
            Err(_) => Err(ExecutorError::Cancelled(format!(
                "{} job dropped before completion",
                self.label
            ))),
        }
    }
}

/// Best-effort extraction of a panic payload message.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn pool(policy: QueuePolicy, depth: usize) -> BlockingPool {
        let pool = BlockingPool::new("test", 2, depth, policy);
        pool.start();
        pool
    }

    #[tokio::test]
    async fn runs_closures_and_returns_results() {
        let pool = pool(QueuePolicy::Block, 8);
        assert_eq!(pool.run(|| 40 + 2).await.unwrap(), 42);
        pool.stop(false);
    }

    #[tokio::test]
    async fn not_started_error_before_start() {
        let pool = BlockingPool::new("idle", 1, 1, QueuePolicy::Block);
        assert!(matches!(
            pool.run(|| ()).await,
            Err(ExecutorError::NotStarted(_))
        ));
    }

    #[tokio::test]
    async fn panics_propagate_as_errors() {
        let pool = pool(QueuePolicy::Block, 8);
        let err = pool
            .run(|| panic!("boom"))
            .await
            .map(|_: ()| ())
            .unwrap_err();
        eprintln!("DEBUG err = {:?}", err);
        assert!(matches!(err, ExecutorError::Panicked(m) if m == "boom"));
        // The worker survives.
        assert_eq!(pool.run(|| 1).await.unwrap(), 1);
        pool.stop(false);
    }

    #[tokio::test]
    async fn fail_fast_reports_overloaded() {
        let pool = pool(QueuePolicy::FailFast, 1);
        // Take the single queue slot, so the next submission has no room.
        let held = pool.slots.clone().try_acquire_owned().unwrap();
        assert!(matches!(
            pool.run(|| ()).await,
            Err(ExecutorError::Overloaded(_))
        ));
        drop(held);
        assert_eq!(pool.run(|| 5).await.unwrap(), 5);
        pool.stop(false);
    }

    #[tokio::test]
    async fn drain_completes_queued_work_on_stop() {
        let pool = pool(QueuePolicy::Block, 16);
        let done = Arc::new(AtomicUsize::new(0));
        let mut joins = Vec::new();
        for _ in 0..6 {
            let done = done.clone();
            let fut = pool.run(move || {
                std::thread::sleep(Duration::from_millis(20));
                done.fetch_add(1, Ordering::SeqCst);
            });
            joins.push(fut);
        }
        for join in joins {
            join.await.unwrap();
        }
        pool.stop(false);
        assert_eq!(done.load(Ordering::SeqCst), 6);
    }
}
