//! Task-Queue Manager
//!
//! Jobs run as tokio tasks on the runtime a [`TaskQueue`] points at, and
//! results go to the queue's result backend. Task states follow the usual
//! task-queue lifecycle:
//!
//! ```text
//! Pending -> Started -> Success | Failure
//!    \          \
//!     +----------+--> Revoked   (terminated)
//! ```
//!
//! Records of ended tasks are dropped on the next launch, whether or not
//! their result was ever polled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{info, warn};

use super::job::JobTarget;
use super::{BackgroundManager, JobFn, JobId, JobOutcome, JobScope, ManagerOptions, ResultStore};
use crate::context::CallbackContext;
use crate::error::ManagerError;
use crate::grouping::Grouping;

/// Lifecycle state of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Started,
    Success,
    Failure,
    Revoked,
}

impl TaskStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Started)
    }
}

/// Handle to a tokio runtime plus the store task results go to.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    handle: Handle,
    backend: Option<Arc<dyn ResultStore>>,
}

impl TaskQueue {
    pub fn new(handle: Handle) -> Self {
        Self { handle, backend: None }
    }

    /// Queue on the runtime the caller is running in.
    pub fn current() -> Result<Self, ManagerError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| ManagerError::NoRuntime(e.to_string()))
    }

    pub fn with_backend(mut self, backend: Arc<dyn ResultStore>) -> Self {
        self.backend = Some(backend);
        self
    }
}

#[derive(Debug)]
struct TaskRecord {
    status: Arc<Mutex<TaskStatus>>,
    abort: AbortHandle,
    scope: JobScope,
}

/// Runs jobs as tasks on a [`TaskQueue`].
#[derive(Debug)]
pub struct TaskQueueManager {
    queue: TaskQueue,
    backend: Arc<dyn ResultStore>,
    options: ManagerOptions,
    tasks: DashMap<JobId, TaskRecord>,
    next_task: AtomicU64,
}

impl TaskQueueManager {
    /// Fails when the queue has no result backend.
    pub fn new(queue: TaskQueue, options: ManagerOptions) -> Result<Self, ManagerError> {
        let backend = queue.backend.clone().ok_or(ManagerError::MissingResultBackend)?;
        Ok(Self {
            queue,
            backend,
            options,
            tasks: DashMap::new(),
            next_task: AtomicU64::new(1),
        })
    }

    pub fn status(&self, job: &JobId) -> Option<TaskStatus> {
        self.tasks.get(job).map(|record| *record.status.lock())
    }
}

impl BackgroundManager for TaskQueueManager {
    fn store(&self) -> Arc<dyn ResultStore> {
        Arc::clone(&self.backend)
    }

    fn options(&self) -> &ManagerOptions {
        &self.options
    }

    fn call_job_fn(
        &self,
        key: &str,
        job_fn: JobFn,
        args: Grouping<Value>,
        context: CallbackContext,
    ) -> Result<JobId, ManagerError> {
        self.tasks.retain(|_, record| record.status.lock().is_active());
        let job = JobId(format!("task-{}", self.next_task.fetch_add(1, Ordering::Relaxed)));
        let scope = JobScope::new();
        let status = Arc::new(Mutex::new(TaskStatus::Pending));
        let target = JobTarget {
            key: key.to_string(),
            store: self.store(),
            expire: self.expire(),
            scope: scope.clone(),
        };

        let task_status = Arc::clone(&status);
        let handle = self.queue.handle.spawn(async move {
            {
                let mut status = task_status.lock();
                if *status != TaskStatus::Pending {
                    return;
                }
                *status = TaskStatus::Started;
            }
            let outcome = job_fn.run_async(&target, args, &context).await;
            let mut status = task_status.lock();
            if status.is_active() {
                *status = match outcome {
                    JobOutcome::Failed => TaskStatus::Failure,
                    JobOutcome::Cancelled => TaskStatus::Revoked,
                    JobOutcome::Completed | JobOutcome::NoUpdate => TaskStatus::Success,
                };
            }
        });

        self.tasks.insert(
            job.clone(),
            TaskRecord {
                status,
                abort: handle.abort_handle(),
                scope,
            },
        );
        info!(job = %job, key, "queued background task");
        Ok(job)
    }

    fn job_running(&self, job: &JobId) -> bool {
        self.status(job).is_some_and(TaskStatus::is_active)
    }

    fn terminate_job(&self, job: &JobId) {
        let Some((_, record)) = self.tasks.remove(job) else {
            return;
        };
        let mut status = record.status.lock();
        if status.is_active() {
            record.abort.abort();
            record.scope.cancel();
            *status = TaskStatus::Revoked;
            info!(job = %job, "revoked background task");
        }
    }

    fn terminate_unhealthy_job(&self, job: &JobId) -> bool {
        let unhealthy = matches!(self.status(job), Some(TaskStatus::Failure | TaskStatus::Revoked));
        if unhealthy {
            warn!(job = %job, "reaping failed background task");
            self.terminate_job(job);
        }
        unhealthy
    }
}
