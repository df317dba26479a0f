//! Background task manager: long-running jobs with queryable lifecycle.
//!
//! Task records live until `clear_completed`; status transitions are
//! Pending → Running → (Completed | Failed | Cancelled). Cancellation is
//! best-effort: a pending task flips straight to Cancelled; a running task
//! is signalled through its [`TaskContext`] and will eventually complete,
//! fail, or stop; it never leaks silently.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::blocking::panic_message;
use crate::ExecutorError;

/// Lifecycle states of a background task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Snapshot of one task record.
#[derive(Clone, Debug)]
pub struct TaskInfo {
    pub task_id: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub progress: Option<f32>,
    pub metadata: HashMap<String, String>,
}

/// Handed to every job; carries the cancellation signal and the progress
/// reporter. Jobs poll `is_cancelled` at convenient points.
#[derive(Clone)]
pub struct TaskContext {
    task_id: String,
    cancel: CancellationToken,
    records: Arc<DashMap<String, Record>>,
}

impl TaskContext {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Report progress in `0.0..=1.0`.
    pub fn set_progress(&self, progress: f32) {
        if let Some(mut record) = self.records.get_mut(&self.task_id) {
            record.info.progress = Some(progress.clamp(0.0, 1.0));
        }
    }
}

type TaskFn = Box<dyn FnOnce(TaskContext) -> Result<serde_json::Value, String> + Send>;

struct Record {
    info: TaskInfo,
    cancel: CancellationToken,
    result: Option<serde_json::Value>,
    done: Arc<Notify>,
}

struct QueuedTask {
    task_id: String,
    f: TaskFn,
}

struct Running {
    tx: crossbeam_channel::Sender<QueuedTask>,
    rx: crossbeam_channel::Receiver<QueuedTask>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

/// Dedicated worker pool for long-running jobs, with exclusive ownership
/// of the task records until they are cleared.
pub struct TaskManager {
    workers: usize,
    queue_depth: usize,
    records: Arc<DashMap<String, Record>>,
    state: Mutex<Option<Running>>,
}

impl TaskManager {
    pub fn new(workers: usize, queue_depth: usize) -> TaskManager {
        TaskManager {
            workers: workers.max(1),
            queue_depth: queue_depth.max(1),
            records: Arc::new(DashMap::new()),
            state: Mutex::new(None),
        }
    }

    /// Spawn the worker pool. Idempotent.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return;
        }
        let (tx, rx) = crossbeam_channel::unbounded::<QueuedTask>();
        let handles = (0..self.workers)
            .map(|i| {
                let rx = rx.clone();
                let records = self.records.clone();
                std::thread::Builder::new()
                    .name(format!("portico-task-{i}"))
                    .spawn(move || {
                        while let Ok(task) = rx.recv() {
                            run_one(&records, task);
                        }
                    })
                    .expect("failed to spawn task worker thread")
            })
            .collect();
        *state = Some(Running { tx, rx, handles });
        tracing::debug!(workers = self.workers, "task manager started");
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }

    /// Stop the pool. Pending tasks are drained unless `cancel_pending`,
    /// in which case they are flipped to Cancelled without running.
    pub fn stop(&self, cancel_pending: bool) {
        let running = self.state.lock().unwrap().take();
        let Some(Running { tx, rx, handles }) = running else {
            return;
        };
        if cancel_pending {
            while let Ok(task) = rx.try_recv() {
                if let Some(mut record) = self.records.get_mut(&task.task_id) {
                    record.info.status = TaskStatus::Cancelled;
                    record.info.completed_at = Some(Utc::now());
                    record.done.notify_waiters();
                }
            }
        }
        drop(tx);
        drop(rx);
        for handle in handles {
            let _ = handle.join();
        }
        tracing::debug!("task manager stopped");
    }

    /// Submit a job. Returns the task id; `Overloaded` when the pending
    /// queue is at depth.
    pub fn submit<F>(
        &self,
        f: F,
        task_id: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Result<String, ExecutorError>
    where
        F: FnOnce(TaskContext) -> Result<serde_json::Value, String> + Send + 'static,
    {
        let state = self.state.lock().unwrap();
        let Some(running) = state.as_ref() else {
            return Err(ExecutorError::NotStarted("tasks".to_string()));
        };

        let pending = self
            .records
            .iter()
            .filter(|r| r.info.status == TaskStatus::Pending)
            .count();
        if pending >= self.queue_depth {
            return Err(ExecutorError::Overloaded(
                "task queue is full".to_string(),
            ));
        }

        let task_id = task_id.unwrap_or_else(|| ulid::Ulid::new().to_string());
        let cancel = CancellationToken::new();
        let record = Record {
            info: TaskInfo {
                task_id: task_id.clone(),
                status: TaskStatus::Pending,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                error: None,
                progress: None,
                metadata,
            },
            cancel: cancel.clone(),
            result: None,
            done: Arc::new(Notify::new()),
        };
        self.records.insert(task_id.clone(), record);

        running
            .tx
            .send(QueuedTask {
                task_id: task_id.clone(),
                f: Box::new(f),
            })
            .map_err(|_| ExecutorError::ShuttingDown("tasks".to_string()))?;

        Ok(task_id)
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.records.get(task_id).map(|r| r.info.status)
    }

    pub fn info(&self, task_id: &str) -> Option<TaskInfo> {
        self.records.get(task_id).map(|r| r.info.clone())
    }

    /// Wait for a terminal state and return the task's value.
    ///
    /// A `Failed` task yields `Panicked`/`Cancelled`-free `ExecutorError`
    /// carrying the recorded message; a timeout leaves the record intact.
    pub async fn result(
        &self,
        task_id: &str,
        timeout: Option<std::time::Duration>,
    ) -> Result<serde_json::Value, ExecutorError> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let done = self
                .records
                .get(task_id)
                .map(|r| r.done.clone())
                .ok_or_else(|| {
                    ExecutorError::Cancelled(format!("unknown task '{task_id}'"))
                })?;
            // Register the waiter before re-reading the status, so a
            // completion between the two cannot be missed.
            let notified = done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let record = self.records.get(task_id).ok_or_else(|| {
                    ExecutorError::Cancelled(format!("unknown task '{task_id}'"))
                })?;
                if record.info.status.is_terminal() {
                    return match record.info.status {
                        TaskStatus::Completed => {
                            Ok(record.result.clone().unwrap_or(serde_json::Value::Null))
                        }
                        TaskStatus::Cancelled => Err(ExecutorError::Cancelled(format!(
                            "task '{task_id}' was cancelled"
                        ))),
                        _ => Err(ExecutorError::Panicked(
                            record
                                .info
                                .error
                                .clone()
                                .unwrap_or_else(|| "task failed".to_string()),
                        )),
                    };
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(ExecutorError::Timeout(format!(
                            "task '{task_id}' did not finish in time"
                        )));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Cancel a task: a pending one moves to Cancelled before any Running
    /// transition; a running one gets a cooperative stop signal.
    pub fn cancel(&self, task_id: &str) -> bool {
        let Some(mut record) = self.records.get_mut(task_id) else {
            return false;
        };
        match record.info.status {
            TaskStatus::Pending => {
                record.info.status = TaskStatus::Cancelled;
                record.info.completed_at = Some(Utc::now());
                record.cancel.cancel();
                record.done.notify_waiters();
                true
            }
            TaskStatus::Running => {
                record.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// All task infos, optionally filtered by status.
    pub fn list(&self, filter_status: Option<TaskStatus>) -> Vec<TaskInfo> {
        let mut infos: Vec<TaskInfo> = self
            .records
            .iter()
            .map(|r| r.info.clone())
            .filter(|info| filter_status.map(|s| info.status == s).unwrap_or(true))
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Drop every record in a terminal state; returns how many were removed.
    pub fn clear_completed(&self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| !r.info.status.is_terminal());
        before - self.records.len()
    }
}

fn run_one(records: &Arc<DashMap<String, Record>>, task: QueuedTask) {
    let ctx = {
        let Some(mut record) = records.get_mut(&task.task_id) else {
            return;
        };
        // A cancel may have landed while the task was queued.
        if record.info.status != TaskStatus::Pending {
            return;
        }
        record.info.status = TaskStatus::Running;
        record.info.started_at = Some(Utc::now());
        TaskContext {
            task_id: task.task_id.clone(),
            cancel: record.cancel.clone(),
            records: records.clone(),
        }
    };

    let cancelled = ctx.cancel.clone();
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| (task.f)(ctx)));

    let Some(mut record) = records.get_mut(&task.task_id) else {
        return;
    };
    record.info.completed_at = Some(Utc::now());
    match outcome {
        Ok(Ok(value)) => {
            if cancelled.is_cancelled() {
                // The job observed the signal and stopped early.
                record.info.status = TaskStatus::Cancelled;
            } else {
                record.info.status = TaskStatus::Completed;
                record.result = Some(value);
            }
        }
        Ok(Err(message)) => {
            record.info.status = TaskStatus::Failed;
            record.info.error = Some(message);
        }
        Err(panic) => {
            record.info.status = TaskStatus::Failed;
            record.info.error = Some(panic_message(&panic));
        }
    }
    record.done.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager() -> TaskManager {
        let manager = TaskManager::new(2, 16);
        manager.start();
        manager
    }

    #[tokio::test]
    async fn submit_result_and_clear() {
        let manager = manager();
        let id = manager
            .submit(
                |_ctx| {
                    std::thread::sleep(Duration::from_millis(50));
                    Ok(serde_json::json!(42))
                },
                None,
                HashMap::new(),
            )
            .unwrap();

        let early = manager.status(&id).unwrap();
        assert!(matches!(early, TaskStatus::Pending | TaskStatus::Running));

        let value = manager
            .result(&id, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!(42));
        assert_eq!(manager.status(&id), Some(TaskStatus::Completed));

        assert_eq!(manager.clear_completed(), 1);
        assert_eq!(manager.status(&id), None);
        manager.stop(false);
    }

    #[tokio::test]
    async fn failure_is_recorded_not_raised() {
        let manager = manager();
        let id = manager
            .submit(|_ctx| Err("exploded".to_string()), None, HashMap::new())
            .unwrap();
        let err = manager
            .result(&id, Some(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Panicked(m) if m == "exploded"));
        let info = manager.info(&id).unwrap();
        assert_eq!(info.status, TaskStatus::Failed);
        assert_eq!(info.error.as_deref(), Some("exploded"));
        manager.stop(false);
    }

    #[tokio::test]
    async fn cancel_pending_before_running() {
        let manager = TaskManager::new(1, 16);
        manager.start();

        // Occupy the single worker so the second task stays pending.
        let _blocker = manager
            .submit(
                |_ctx| {
                    std::thread::sleep(Duration::from_millis(200));
                    Ok(serde_json::Value::Null)
                },
                None,
                HashMap::new(),
            )
            .unwrap();
        let pending = manager
            .submit(
                |_ctx| Ok(serde_json::json!("never runs")),
                None,
                HashMap::new(),
            )
            .unwrap();

        assert_eq!(manager.status(&pending), Some(TaskStatus::Pending));
        assert!(manager.cancel(&pending));
        assert_eq!(manager.status(&pending), Some(TaskStatus::Cancelled));

        // The worker later pops it from the queue and must not run it.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.status(&pending), Some(TaskStatus::Cancelled));
        manager.stop(false);
    }

    #[tokio::test]
    async fn cancel_running_is_cooperative() {
        let manager = manager();
        let id = manager
            .submit(
                |ctx| {
                    for _ in 0..100 {
                        if ctx.is_cancelled() {
                            return Ok(serde_json::Value::Null);
                        }
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Ok(serde_json::json!("finished"))
                },
                None,
                HashMap::new(),
            )
            .unwrap();

        // Let it start, then signal.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(manager.cancel(&id));
        let err = manager
            .result(&id, Some(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled(_)));
        manager.stop(false);
    }

    #[tokio::test]
    async fn list_filters_by_status_and_progress_updates() {
        let manager = manager();
        let id = manager
            .submit(
                |ctx| {
                    ctx.set_progress(0.5);
                    Ok(serde_json::Value::Null)
                },
                Some("job-1".to_string()),
                HashMap::from([("kind".to_string(), "report".to_string())]),
            )
            .unwrap();
        assert_eq!(id, "job-1");

        manager.result(&id, Some(Duration::from_secs(2))).await.unwrap();
        let done = manager.list(Some(TaskStatus::Completed));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].progress, Some(0.5));
        assert_eq!(done[0].metadata.get("kind").map(String::as_str), Some("report"));
        assert!(manager.list(Some(TaskStatus::Running)).is_empty());
        manager.stop(false);
    }

    #[tokio::test]
    async fn result_timeout_leaves_record() {
        let manager = manager();
        let id = manager
            .submit(
                |_ctx| {
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(serde_json::Value::Null)
                },
                None,
                HashMap::new(),
            )
            .unwrap();
        let err = manager
            .result(&id, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout(_)));
        assert!(manager.status(&id).is_some());
        manager.stop(false);
    }

    #[tokio::test]
    async fn submit_requires_start() {
        let manager = TaskManager::new(1, 4);
        assert!(matches!(
            manager.submit(|_| Ok(serde_json::Value::Null), None, HashMap::new()),
            Err(ExecutorError::NotStarted(_))
        ));
    }
}
