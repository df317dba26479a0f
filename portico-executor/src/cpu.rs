//! Dedicated workers for CPU-bound jobs.
//!
//! The original design of this subsystem ran worker *processes*; here the
//! workers are dedicated OS threads, which give the same parallelism with
//! a much cheaper submission path. The contract is unchanged: a fixed
//! worker count, an optional per-worker initializer that preloads
//! expensive state exactly once, and no sharing of that state between
//! workers; jobs see it read-only.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, Semaphore, TryAcquireError};

use crate::blocking::panic_message;
use crate::{ExecutorError, QueuePolicy};

/// Read-only per-worker state produced by the initializer.
pub type WorkerState = Box<dyn Any + Send>;

type Initializer = Arc<dyn Fn(usize) -> WorkerState + Send + Sync>;
type Job = Box<dyn FnOnce(&WorkerState) + Send>;

struct Running {
    tx: crossbeam_channel::Sender<Job>,
    rx: crossbeam_channel::Receiver<Job>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

/// M dedicated workers behind a depth-bounded queue.
pub struct CpuPool {
    workers: usize,
    policy: QueuePolicy,
    initializer: Mutex<Option<Initializer>>,
    slots: Arc<Semaphore>,
    state: Mutex<Option<Running>>,
}

impl CpuPool {
    pub fn new(workers: usize, queue_depth: usize, policy: QueuePolicy) -> CpuPool {
        CpuPool {
            workers: workers.max(1),
            policy,
            initializer: Mutex::new(None),
            slots: Arc::new(Semaphore::new(queue_depth.max(1))),
            state: Mutex::new(None),
        }
    }

    /// Install the per-worker initializer. Must be called before `start`;
    /// the produced state is owned by one worker and never shared.
    pub fn set_initializer<S, F>(&self, init: F)
    where
        S: Any + Send,
        F: Fn(usize) -> S + Send + Sync + 'static,
    {
        let erased: Initializer = Arc::new(move |worker| Box::new(init(worker)) as WorkerState);
        *self.initializer.lock().unwrap() = Some(erased);
    }

    /// Spawn the workers, running the initializer once on each. Idempotent.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return;
        }
        let initializer = self.initializer.lock().unwrap().clone();
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let handles = (0..self.workers)
            .map(|i| {
                let rx = rx.clone();
                let initializer = initializer.clone();
                std::thread::Builder::new()
                    .name(format!("portico-cpu-{i}"))
                    .spawn(move || {
                        let worker_state: WorkerState = match initializer {
                            Some(init) => init(i),
                            None => Box::new(()),
                        };
                        while let Ok(job) = rx.recv() {
                            job(&worker_state);
                        }
                    })
                    .expect("failed to spawn cpu worker thread")
            })
            .collect();
        *state = Some(Running { tx, rx, handles });
        tracing::debug!(workers = self.workers, "cpu pool started");
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }

    pub fn stop(&self, cancel_pending: bool) {
        let running = self.state.lock().unwrap().take();
        let Some(Running { tx, rx, handles }) = running else {
            return;
        };
        if cancel_pending {
            while rx.try_recv().is_ok() {}
        }
        drop(tx);
        drop(rx);
        for handle in handles {
            let _ = handle.join();
        }
        tracing::debug!("cpu pool stopped");
    }

    async fn acquire_slot(&self) -> Result<tokio::sync::OwnedSemaphorePermit, ExecutorError> {
        match self.policy {
            QueuePolicy::Block => self
                .slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ExecutorError::ShuttingDown("cpu".to_string())),
            QueuePolicy::FailFast => self
                .slots
                .clone()
                .try_acquire_owned()
                .map_err(|err| match err {
                    TryAcquireError::NoPermits => {
                        ExecutorError::Overloaded("cpu queue is full".to_string())
                    }
                    TryAcquireError::Closed => ExecutorError::ShuttingDown("cpu".to_string()),
                }),
        }
    }

    /// Schedule a CPU job and wait for its result. The job receives the
    /// worker's preloaded state; exceptions re-raise in the caller's
    /// execution context as errors.
    pub async fn run<F, R>(&self, f: F) -> Result<R, ExecutorError>
    where
        F: FnOnce(&WorkerState) -> R + Send + 'static,
        R: Send + 'static,
    {
        if !self.is_started() {
            return Err(ExecutorError::NotStarted("cpu".to_string()));
        }
        let permit = self.acquire_slot().await?;
        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = Box::new(move |worker_state| {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| f(worker_state)));
            let _ = result_tx.send(outcome);
            drop(permit);
        });
        {
            let state = self.state.lock().unwrap();
            match state.as_ref() {
                Some(running) => running
                    .tx
                    .send(job)
                    .map_err(|_| ExecutorError::ShuttingDown("cpu".to_string()))?,
                None => return Err(ExecutorError::NotStarted("cpu".to_string())),
            }
        }

        match result_rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(panic)) => Err(ExecutorError::Panicked(panic_message(&panic))),
            Err(_) => Err(ExecutorError::Cancelled(
                "cpu job dropped before completion".to_string(),
            )),
        }
    }
}
