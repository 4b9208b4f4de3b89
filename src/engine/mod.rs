//! Lifecycle engine over the live job set.
//!
//! Every mutation of a job or task goes through one engine method. Each
//! method locks the job it touches, applies the transition, persists it
//! through the [`PersistenceGateway`] while still holding the lock, and
//! only then emits events. Side effects that must run without the lock
//! (returning nodes, scheduling a delayed restart, job housekeeping)
//! come back to the caller in a [`TerminationBatch`].

mod admin;
mod completion;
mod control;
mod dispatch;
mod finalize;
mod scheduling;

pub use scheduling::SchedulingBatch;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{EngineConfig, RetryBackoff, SteppedBackoff};
use crate::error::Result;
use crate::model::{JobId, JobRecord, JobStatus, TaskId, TaskRecord, TaskStatus};
use crate::registry::JobRegistry;
use crate::running::{RunningTask, RunningTaskIndex};
use crate::traits::{Notifier, PersistenceGateway, SchedulerEvent, SignalChannelStore};

/// Shared, thread-safe core of the scheduler.
pub struct LifecycleEngine {
    registry: JobRegistry,
    running: RunningTaskIndex,
    persistence: Arc<dyn PersistenceGateway>,
    notifier: Arc<dyn Notifier>,
    signals: Arc<dyn SignalChannelStore>,
    backoff: Arc<dyn RetryBackoff>,
    config: EngineConfig,
}

impl LifecycleEngine {
    pub fn new(
        config: EngineConfig,
        persistence: Arc<dyn PersistenceGateway>,
        notifier: Arc<dyn Notifier>,
        signals: Arc<dyn SignalChannelStore>,
    ) -> Self {
        Self {
            registry: JobRegistry::new(),
            running: RunningTaskIndex::new(),
            persistence,
            notifier,
            signals,
            backoff: Arc::new(SteppedBackoff::default()),
            config,
        }
    }

    pub fn with_backoff(mut self, backoff: Arc<dyn RetryBackoff>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn running(&self) -> &RunningTaskIndex {
        &self.running
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Adds a freshly submitted job to the live set.
    ///
    /// The job is persisted before anyone can observe it; a persistence
    /// failure unregisters it again and surfaces the error.
    pub fn submit_job(&self, mut record: JobRecord) -> Result<JobId> {
        record.recount();
        let guard = self.registry.register(record)?;
        if let Err(err) = self.persistence.commit_new_job(&guard) {
            self.registry.evict(&guard);
            return Err(err.into());
        }
        if let Err(err) = self.notifier.job_submitted(&guard) {
            warn!(job = %guard.id(), %err, "submission notification dropped");
        }
        info!(
            job = %guard.id(),
            owner = %guard.owner,
            tasks = guard.counts.total,
            "job submitted"
        );
        Ok(guard.id())
    }

    /// Puts a job recovered from the durable store back in the live
    /// set, rebuilding execution handles for its running tasks. Nothing
    /// is persisted: the store is the source we just read from.
    pub fn recover_job(&self, mut record: JobRecord) -> Result<JobId> {
        record.recount();
        let guard = self.registry.register(record)?;
        for task in guard.tasks.values() {
            if task.status != TaskStatus::Running {
                continue;
            }
            match &task.placement {
                Some(launcher) => self.running.insert(RunningTask::new(
                    task.id,
                    guard.owner.clone(),
                    guard.credentials.clone(),
                    launcher.clone(),
                    task.current_attempt(),
                )),
                None => {
                    warn!(task = %task.id, "recovered running task has no placement");
                }
            }
        }
        info!(job = %guard.id(), status = %guard.status, "job recovered");
        Ok(guard.id())
    }

    pub fn job_status(&self, job_id: JobId) -> Option<JobStatus> {
        self.registry.lock(job_id).map(|guard| guard.status)
    }

    pub fn is_job_alive(&self, job_id: JobId) -> bool {
        self.registry.contains(job_id)
    }

    pub fn task_status(&self, task_id: TaskId) -> Option<TaskStatus> {
        let guard = self.registry.lock(task_id.job)?;
        guard.task(task_id).map(|task| task.status)
    }

    pub fn is_task_alive(&self, task_id: TaskId) -> bool {
        self.task_status(task_id)
            .map(|status| status.is_alive())
            .unwrap_or(false)
    }

    pub fn has_job_owned_by(&self, owner: &str) -> bool {
        self.registry.job_ids().into_iter().any(|id| {
            self.registry
                .lock(id)
                .map(|guard| guard.owner == owner)
                .unwrap_or(false)
        })
    }

    pub fn running_tasks(&self, job_id: JobId) -> Vec<TaskId> {
        self.running.tasks_of_job(job_id)
    }

    pub fn running_task(&self, task_id: TaskId) -> Option<RunningTask> {
        self.running.get(task_id)
    }

    pub fn running_task_count(&self) -> usize {
        self.running.len()
    }

    /// Whether a liveness probe against this task makes sense right
    /// now. Handles disappear with the execution, so this is simply
    /// handle presence.
    pub fn can_ping(&self, task_id: TaskId) -> bool {
        self.running.contains(task_id)
    }

    /// Records one failed liveness probe, returning the new count so
    /// the monitor can decide when to declare the node dead.
    pub fn record_failed_ping(&self, task_id: TaskId) -> Option<u32> {
        self.running.record_failed_ping(task_id)
    }

    pub(crate) fn publish_job(&self, event: SchedulerEvent, job: &JobRecord) {
        if let Err(err) = self.notifier.job_state_updated(event, &job.info()) {
            warn!(job = %job.id, %event, %err, "job notification dropped");
        }
    }

    pub(crate) fn publish_task(&self, event: SchedulerEvent, task: &TaskRecord) {
        if let Err(err) = self.notifier.task_state_updated(event, &task.info()) {
            warn!(task = %task.id, %event, %err, "task notification dropped");
        }
    }

    pub(crate) fn publish_job_full(&self, job: &JobRecord) {
        if let Err(err) = self.notifier.job_updated_full_data(job) {
            warn!(job = %job.id, %err, "job full-data notification dropped");
        }
    }
}
