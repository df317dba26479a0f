//! Execution subsystem for Portico.
//!
//! Three independent pools with explicit lifecycles:
//!
//! - [`BlockingPool`]: worker threads for sync I/O and legacy libraries.
//! - [`CpuPool`]: dedicated workers for CPU-bound jobs, with an optional
//!   per-worker initializer that preloads read-only state.
//! - [`TaskManager`]: long-running background jobs with queryable
//!   lifecycle records, independent of any request lifetime.
//!
//! Every pool enforces a maximum queue depth. Submission beyond the depth
//! blocks (the default) or fails fast with [`ExecutorError::Overloaded`],
//! configured per pool. Shutdown drains queued work by default;
//! `cancel_pending` aborts the queue instead.

mod blocking;
mod cpu;
mod tasks;

pub use blocking::BlockingPool;
pub use cpu::CpuPool;
pub use tasks::{TaskContext, TaskInfo, TaskManager, TaskStatus};

/// Errors raised by the execution subsystem.
#[derive(Clone, Debug)]
pub enum ExecutorError {
    /// The pool was used before lifespan startup (or after stop).
    NotStarted(String),
    /// The queue is at depth and the pool is configured to fail fast.
    Overloaded(String),
    /// The submission was cancelled before completion.
    Cancelled(String),
    /// A result wait exceeded its timeout.
    Timeout(String),
    /// The job panicked on a worker.
    Panicked(String),
    /// The pool is stopping and no longer accepts work.
    ShuttingDown(String),
}

impl std::fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorError::NotStarted(m) => write!(f, "pool not started: {m}"),
            ExecutorError::Overloaded(m) => write!(f, "pool overloaded: {m}"),
            ExecutorError::Cancelled(m) => write!(f, "cancelled: {m}"),
            ExecutorError::Timeout(m) => write!(f, "timed out: {m}"),
            ExecutorError::Panicked(m) => write!(f, "worker panicked: {m}"),
            ExecutorError::ShuttingDown(m) => write!(f, "pool shutting down: {m}"),
        }
    }
}

impl std::error::Error for ExecutorError {}

/// What happens when a submission finds the queue at depth.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Wait for a slot (backpressure).
    Block,
    /// Fail immediately with `Overloaded`.
    FailFast,
}

/// Sizing and queueing configuration for the three pools.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub blocking_threads: usize,
    pub cpu_workers: usize,
    pub task_workers: usize,
    pub queue_depth: usize,
    pub queue_policy: QueuePolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            blocking_threads: 8,
            cpu_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            task_workers: 2,
            queue_depth: 256,
            queue_policy: QueuePolicy::Block,
        }
    }
}

/// The three pools with one shared lifecycle, bound to the server's
/// lifespan: started during startup, stopped (drain first) at shutdown.
pub struct ExecutionSubsystem {
    blocking: BlockingPool,
    cpu: CpuPool,
    tasks: TaskManager,
}

impl ExecutionSubsystem {
    pub fn new(config: ExecutorConfig) -> ExecutionSubsystem {
        ExecutionSubsystem {
            blocking: BlockingPool::new(
                "blocking",
                config.blocking_threads,
                config.queue_depth,
                config.queue_policy,
            ),
            cpu: CpuPool::new(
                config.cpu_workers,
                config.queue_depth,
                config.queue_policy,
            ),
            tasks: TaskManager::new(config.task_workers, config.queue_depth),
        }
    }

    pub fn blocking(&self) -> &BlockingPool {
        &self.blocking
    }

    pub fn cpu(&self) -> &CpuPool {
        &self.cpu
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    /// Start every pool. Idempotent.
    pub fn start_all(&self) {
        self.blocking.start();
        self.cpu.start();
        self.tasks.start();
    }

    /// Stop every pool, draining queued work unless `cancel_pending`.
    pub fn stop_all(&self, cancel_pending: bool) {
        self.tasks.stop(cancel_pending);
        self.cpu.stop(cancel_pending);
        self.blocking.stop(cancel_pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subsystem_lifecycle_is_idempotent() {
        let subsystem = ExecutionSubsystem::new(ExecutorConfig::default());
        subsystem.start_all();
        subsystem.start_all();
        let out = subsystem.blocking().run(|| 7).await.unwrap();
        assert_eq!(out, 7);
        subsystem.stop_all(false);
        subsystem.stop_all(false);
    }
}
