//! Side effects collected while a job lock is held.
//!
//! Lifecycle operations never talk to nodes or timers directly. They
//! record what must happen next in a [`TerminationBatch`] and the
//! caller applies it after the locks are gone.

use std::collections::HashMap;
use std::time::Duration;

use crate::model::{Credentials, JobId, JobRecord, TaskId, TaskOutcome};
use crate::running::RunningTask;

/// Why an execution's nodes are being given back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseCause {
    /// The execution ran to completion, successfully or not.
    Normal,
    /// The execution was cut short by a kill, preempt or job end.
    Aborted,
    /// The node under the execution died. Nothing to clean up there.
    NodeFailed,
}

/// One execution whose nodes must be returned to the pool.
#[derive(Debug, Clone)]
pub struct ReleasedTask {
    pub job_id: JobId,
    pub handle: RunningTask,
    pub cause: ReleaseCause,
    /// Present when the execution produced a result before release.
    pub outcome: Option<TaskOutcome>,
}

/// A job that left the live set, with what housekeeping needs from it.
#[derive(Debug, Clone)]
pub struct TerminatedJob {
    pub job_id: JobId,
    pub generic_info: HashMap<String, String>,
    pub credentials: Credentials,
    pub has_errors: bool,
}

/// A task to put back in the queue once the delay elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayedRestart {
    pub task_id: TaskId,
    pub delay: Duration,
}

/// Write-once collection of deferred effects.
#[derive(Debug, Default)]
pub struct TerminationBatch {
    released: Vec<ReleasedTask>,
    terminated_jobs: Vec<TerminatedJob>,
    delayed_restarts: Vec<DelayedRestart>,
}

impl TerminationBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_released(
        &mut self,
        job_id: JobId,
        handle: RunningTask,
        cause: ReleaseCause,
        outcome: Option<TaskOutcome>,
    ) {
        self.released.push(ReleasedTask {
            job_id,
            handle,
            cause,
            outcome,
        });
    }

    pub(crate) fn add_terminated_job(&mut self, job: &JobRecord, has_errors: bool) {
        self.terminated_jobs.push(TerminatedJob {
            job_id: job.id,
            generic_info: job.generic_info.clone(),
            credentials: job.credentials.clone(),
            has_errors,
        });
    }

    pub(crate) fn add_delayed_restart(&mut self, task_id: TaskId, delay: Duration) {
        self.delayed_restarts.push(DelayedRestart { task_id, delay });
    }

    pub fn released(&self) -> &[ReleasedTask] {
        &self.released
    }

    pub fn terminated_jobs(&self) -> &[TerminatedJob] {
        &self.terminated_jobs
    }

    pub fn delayed_restarts(&self) -> &[DelayedRestart] {
        &self.delayed_restarts
    }

    pub fn is_empty(&self) -> bool {
        self.released.is_empty()
            && self.terminated_jobs.is_empty()
            && self.delayed_restarts.is_empty()
    }

    /// Folds another batch into this one, keeping arrival order.
    pub fn merge(&mut self, other: TerminationBatch) {
        let (released, terminated, restarts) = other.into_parts();
        self.released.extend(released);
        self.terminated_jobs.extend(terminated);
        self.delayed_restarts.extend(restarts);
    }

    pub fn into_parts(self) -> (Vec<ReleasedTask>, Vec<TerminatedJob>, Vec<DelayedRestart>) {
        (self.released, self.terminated_jobs, self.delayed_restarts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LauncherRef, TaskId};

    fn handle(job: JobId) -> RunningTask {
        RunningTask::new(
            TaskId { job, index: 0 },
            "alice",
            Credentials::default(),
            LauncherRef::new("node-1:7070", vec![1]),
            1,
        )
    }

    #[test]
    fn empty_batch_reports_empty() {
        let batch = TerminationBatch::new();
        assert!(batch.is_empty());
        assert!(batch.released().is_empty());
        assert!(batch.terminated_jobs().is_empty());
        assert!(batch.delayed_restarts().is_empty());
    }

    #[test]
    fn batch_collects_each_kind() {
        let job = JobRecord::new("demo", "alice");
        let mut batch = TerminationBatch::new();
        batch.add_released(job.id, handle(job.id), ReleaseCause::Aborted, None);
        batch.add_terminated_job(&job, true);
        batch.add_delayed_restart(job.task_id(0), Duration::from_secs(5));

        assert!(!batch.is_empty());
        assert_eq!(batch.released().len(), 1);
        assert_eq!(batch.released()[0].cause, ReleaseCause::Aborted);
        assert!(batch.terminated_jobs()[0].has_errors);
        assert_eq!(
            batch.delayed_restarts()[0],
            DelayedRestart {
                task_id: job.task_id(0),
                delay: Duration::from_secs(5),
            }
        );
    }

    #[test]
    fn merge_preserves_order() {
        let job_a = JobRecord::new("a", "alice");
        let job_b = JobRecord::new("b", "bob");

        let mut first = TerminationBatch::new();
        first.add_delayed_restart(job_a.task_id(0), Duration::ZERO);

        let mut second = TerminationBatch::new();
        second.add_delayed_restart(job_b.task_id(0), Duration::from_secs(1));
        second.add_terminated_job(&job_b, false);

        first.merge(second);
        assert_eq!(first.delayed_restarts().len(), 2);
        assert_eq!(first.delayed_restarts()[0].task_id, job_a.task_id(0));
        assert_eq!(first.delayed_restarts()[1].task_id, job_b.task_id(0));
        assert_eq!(first.terminated_jobs().len(), 1);
    }
}
