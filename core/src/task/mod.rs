//! Units of work and the scheduler that runs them.

pub mod transfer;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::errors::FileError;

/// Lifecycle of a task. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    Created,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A cancellable unit of work run by a [`Scheduler`].
#[async_trait::async_trait]
pub trait Task: Send + Sync {
    /// Run the task to completion. A task runs at most once.
    async fn run(&self) -> Result<(), FileError>;

    /// Request cancellation. Idempotent; callable from any thread.
    fn cancel(&self);

    fn is_cancelled(&self) -> bool;
}

/// Runs queued tasks with a bounded number in flight.
///
/// Tasks start in the order they were added.
pub struct Scheduler {
    limit: Arc<Semaphore>,
    queue: Mutex<VecDeque<Arc<dyn Task>>>,
    active: Mutex<Vec<Arc<dyn Task>>>,
}

impl Scheduler {
    /// A scheduler running at most `concurrency` tasks at once (minimum 1).
    pub fn new(concurrency: usize) -> Self {
        Self {
            limit: Arc::new(Semaphore::new(concurrency.max(1))),
            queue: Mutex::new(VecDeque::new()),
            active: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, task: Arc<dyn Task>) {
        lock(&self.queue).push_back(task);
    }

    /// Number of tasks waiting to start.
    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every queued task and return their results in queue order.
    pub async fn run_all(&self) -> Vec<Result<(), FileError>> {
        let tasks: Vec<Arc<dyn Task>> = lock(&self.queue).drain(..).collect();
        info!(count = tasks.len(), "running tasks");
        lock(&self.active).extend(tasks.iter().cloned());

        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let permit = match self.limit.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    handles.push(Err(FileError::OperationFailed(format!(
                        "Scheduler closed: {e}"
                    ))));
                    continue;
                }
            };
            handles.push(Ok(tokio::spawn(async move {
                let result = task.run().await;
                drop(permit);
                result
            })));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            let result = match handle {
                Ok(join) => join
                    .await
                    .unwrap_or_else(|e| Err(FileError::OperationFailed(format!(
                        "Task join failed: {e}"
                    )))),
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                debug!(error = %e, "task ended with error");
            }
            results.push(result);
        }
        lock(&self.active).clear();
        results
    }

    /// Cancel every queued and running task.
    pub fn cancel_all(&self) {
        let queued = lock(&self.queue);
        let active = lock(&self.active);
        info!(
            queued = queued.len(),
            active = active.len(),
            "cancelling all tasks"
        );
        for task in queued.iter().chain(active.iter()) {
            task.cancel();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingTask {
        cancelled: AtomicBool,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        order: Arc<Mutex<Vec<usize>>>,
        id: usize,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Task for CountingTask {
        async fn run(&self) -> Result<(), FileError> {
            self.order.lock().unwrap().push(self.id);
            if self.is_cancelled() {
                return Err(FileError::Cancelled);
            }
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                Err(FileError::OperationFailed(format!("task {}", self.id)))
            } else {
                Ok(())
            }
        }

        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }

        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }
    }

    fn tasks(count: usize) -> (Vec<Arc<CountingTask>>, Arc<AtomicUsize>, Arc<Mutex<Vec<usize>>>) {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let tasks = (0..count)
            .map(|id| {
                Arc::new(CountingTask {
                    running: running.clone(),
                    peak: peak.clone(),
                    order: order.clone(),
                    id,
                    fail: id == 2,
                    ..CountingTask::default()
                })
            })
            .collect();
        (tasks, peak, order)
    }

    #[test]
    fn task_state_display() {
        assert_eq!(TaskState::Running.to_string(), "running");
        assert_eq!(TaskState::Cancelled.to_string(), "cancelled");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn run_all_respects_limit_and_keeps_order() {
        let scheduler = Scheduler::new(2);
        let (tasks, peak, order) = tasks(5);
        for task in &tasks {
            scheduler.add(task.clone());
        }
        assert_eq!(scheduler.len(), 5);

        let results = scheduler.run_all().await;
        assert_eq!(results.len(), 5);
        assert!(results[0].is_ok());
        assert!(matches!(results[2], Err(FileError::OperationFailed(_))));
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(order.lock().unwrap().len(), 5);
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn cancel_all_reaches_queued_tasks() {
        let scheduler = Scheduler::new(1);
        let (tasks, _, _) = tasks(3);
        for task in &tasks {
            scheduler.add(task.clone());
        }
        scheduler.cancel_all();
        assert!(tasks.iter().all(|t| t.is_cancelled()));

        let results = scheduler.run_all().await;
        assert!(results.iter().all(|r| matches!(r, Err(FileError::Cancelled))));
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let scheduler = Scheduler::new(0);
        assert_eq!(scheduler.limit.available_permits(), 1);
    }
}
