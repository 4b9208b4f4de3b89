//! Collaborator interfaces driven at transition boundaries.
//!
//! The engine owns all in-memory state; durable writes, event fan-out and
//! signal-channel cleanup sit behind these traits so the embedding
//! scheduler can bring its own store and bus. Persistence is called
//! synchronously while the job lock is held, which keeps the durable
//! commit order identical to the in-memory mutation order.

use std::fmt;

use thiserror::Error;

use crate::model::{JobInfo, JobRecord, TaskInfo, TaskRecord};

/// Failure reported by the durable store. Fatal to the transition that
/// triggered the write.
#[derive(Debug, Clone, Error)]
#[error("{context}: {message}")]
pub struct PersistenceError {
    context: &'static str,
    message: String,
}

impl PersistenceError {
    pub fn new(context: &'static str, message: impl Into<String>) -> Self {
        Self {
            context,
            message: message.into(),
        }
    }
}

/// Failure reported by the event bus. Logged and dropped.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct NotifyError(pub String);

/// Failure reported by the signal-channel store. Logged and dropped.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct SignalError(pub String);

/// State transitions published through [`Notifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerEvent {
    JobSubmitted,
    JobPendingToRunning,
    JobRunningToFinished,
    JobPendingToFinished,
    JobPaused,
    JobResumed,
    JobInError,
    JobRestartedFromError,
    JobPriorityChanged,
    JobUpdated,
    TaskPendingToRunning,
    TaskRunningToFinished,
    TaskWaitingForRestart,
    TaskInError,
    TaskInErrorToFinished,
}

impl fmt::Display for SchedulerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulerEvent::JobSubmitted => "job-submitted",
            SchedulerEvent::JobPendingToRunning => "job-pending-to-running",
            SchedulerEvent::JobRunningToFinished => "job-running-to-finished",
            SchedulerEvent::JobPendingToFinished => "job-pending-to-finished",
            SchedulerEvent::JobPaused => "job-paused",
            SchedulerEvent::JobResumed => "job-resumed",
            SchedulerEvent::JobInError => "job-in-error",
            SchedulerEvent::JobRestartedFromError => "job-restarted-from-error",
            SchedulerEvent::JobPriorityChanged => "job-priority-changed",
            SchedulerEvent::JobUpdated => "job-updated",
            SchedulerEvent::TaskPendingToRunning => "task-pending-to-running",
            SchedulerEvent::TaskRunningToFinished => "task-running-to-finished",
            SchedulerEvent::TaskWaitingForRestart => "task-waiting-for-restart",
            SchedulerEvent::TaskInError => "task-in-error",
            SchedulerEvent::TaskInErrorToFinished => "task-in-error-to-finished",
        };
        f.write_str(s)
    }
}

/// Durable store behind the engine. One synchronous call per transition
/// type; an error aborts the transition that triggered it.
pub trait PersistenceGateway: Send + Sync + 'static {
    fn commit_new_job(&self, job: &JobRecord) -> Result<(), PersistenceError>;

    fn commit_task_started(&self, job: &JobRecord, task: &TaskRecord)
        -> Result<(), PersistenceError>;

    /// A task reached an outcome: finished, faulty, aborted or suspended.
    fn commit_task_finished(
        &self,
        job: &JobRecord,
        task: &TaskRecord,
    ) -> Result<(), PersistenceError>;

    /// A task went back into the queue without a result.
    fn commit_task_restarted(
        &self,
        job: &JobRecord,
        task: &TaskRecord,
    ) -> Result<(), PersistenceError>;

    fn commit_job_priority_changed(&self, job: &JobRecord) -> Result<(), PersistenceError>;

    fn commit_job_paused_or_resumed(&self, job: &JobRecord) -> Result<(), PersistenceError>;

    /// Covers every forced termination: kill, cancel, node-failure fail.
    fn commit_job_killed(&self, job: &JobRecord) -> Result<(), PersistenceError>;

    fn commit_start_at_changed(&self, job: &JobRecord) -> Result<(), PersistenceError>;

    fn commit_attached_services_changed(&self, job: &JobRecord) -> Result<(), PersistenceError>;

    fn commit_external_endpoints_changed(&self, job: &JobRecord) -> Result<(), PersistenceError>;

    fn commit_children_count_changed(&self, job: &JobRecord) -> Result<(), PersistenceError>;
}

/// Event fan-out. Fire and forget: the engine logs failures and moves on,
/// so implementations must never block for long.
pub trait Notifier: Send + Sync + 'static {
    fn job_submitted(&self, job: &JobRecord) -> Result<(), NotifyError>;

    fn job_state_updated(&self, event: SchedulerEvent, info: &JobInfo) -> Result<(), NotifyError>;

    fn task_state_updated(&self, event: SchedulerEvent, info: &TaskInfo)
        -> Result<(), NotifyError>;

    /// Full record for consumers that need more than the info snapshot.
    fn job_updated_full_data(&self, job: &JobRecord) -> Result<(), NotifyError>;
}

/// Store of per-job signal channels, cleaned up at job termination.
pub trait SignalChannelStore: Send + Sync + 'static {
    fn channel_exists(&self, channel: &str) -> Result<bool, SignalError>;

    fn delete_channel(&self, channel: &str) -> Result<(), SignalError>;
}

/// Signal store for embeddings without signal support: no channel ever
/// exists, nothing is ever deleted.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSignals;

impl SignalChannelStore for NoSignals {
    fn channel_exists(&self, _channel: &str) -> Result<bool, SignalError> {
        Ok(false)
    }

    fn delete_channel(&self, _channel: &str) -> Result<(), SignalError> {
        Ok(())
    }
}
