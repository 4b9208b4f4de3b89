use thiserror::Error;

use crate::model::{JobId, TaskId};
use crate::traits::PersistenceError;

/// Errors surfaced by lifecycle operations. Task execution errors are
/// ordinary data routed through the error policy, never error values.
#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    #[error("Unknown job {0}")]
    UnknownJob(JobId),

    #[error("Unknown task {0}")]
    UnknownTask(TaskId),

    #[error("Task {0} already has a running execution")]
    TaskAlreadyRunning(TaskId),

    #[error("Task {0} has no running execution")]
    TaskNotRunning(TaskId),

    #[error("Task {0} cannot start from its current state")]
    TaskNotSchedulable(TaskId),

    #[error("Job {0} is already registered")]
    DuplicateJob(JobId),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] PersistenceError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
