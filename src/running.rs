//! Index of executions currently holding nodes.
//!
//! One entry per running task, kept outside the per-job locks so node
//! monitors and the dispatcher can consult it without touching a job.

use dashmap::DashMap;

use crate::model::{Credentials, JobId, LauncherRef, TaskId};

/// Live execution handle for one running task attempt.
#[derive(Debug, Clone)]
pub struct RunningTask {
    pub task_id: TaskId,
    /// Owner of the enclosing job, for node-side cleanup.
    pub owner: String,
    pub credentials: Credentials,
    pub launcher: LauncherRef,
    /// Attempt number the handle was created for. A stale handle from a
    /// previous attempt must not be mistaken for the current one.
    pub attempt: u32,
    /// Consecutive failed liveness probes against the launcher.
    pub ping_failures: u32,
}

impl RunningTask {
    pub fn new(
        task_id: TaskId,
        owner: impl Into<String>,
        credentials: Credentials,
        launcher: LauncherRef,
        attempt: u32,
    ) -> Self {
        Self {
            task_id,
            owner: owner.into(),
            credentials,
            launcher,
            attempt,
            ping_failures: 0,
        }
    }
}

/// Concurrent map of all running task handles.
#[derive(Debug, Default)]
pub struct RunningTaskIndex {
    tasks: DashMap<TaskId, RunningTask>,
}

impl RunningTaskIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, handle: RunningTask) {
        let previous = self.tasks.insert(handle.task_id, handle);
        debug_assert!(previous.is_none(), "task registered twice");
    }

    pub(crate) fn remove(&self, task_id: TaskId) -> Option<RunningTask> {
        self.tasks.remove(&task_id).map(|(_, handle)| handle)
    }

    /// Removes and returns every handle belonging to one job.
    pub(crate) fn drain_job(&self, job_id: JobId) -> Vec<RunningTask> {
        let ids: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|entry| entry.key().job == job_id)
            .map(|entry| *entry.key())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    pub fn get(&self, task_id: TaskId) -> Option<RunningTask> {
        self.tasks.get(&task_id).map(|entry| entry.clone())
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.tasks.contains_key(&task_id)
    }

    pub fn tasks_of_job(&self, job_id: JobId) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|entry| entry.key().job == job_id)
            .map(|entry| *entry.key())
            .collect()
    }

    /// True when a handle exists for this exact attempt. Results coming
    /// back from an earlier attempt are dropped by the caller.
    pub fn is_current(&self, task_id: TaskId, attempt: u32) -> bool {
        self.tasks
            .get(&task_id)
            .map(|handle| handle.attempt == attempt)
            .unwrap_or(false)
    }

    /// Bumps the failed-ping counter, returning the new count.
    pub(crate) fn record_failed_ping(&self, task_id: TaskId) -> Option<u32> {
        self.tasks.get_mut(&task_id).map(|mut handle| {
            handle.ping_failures += 1;
            handle.ping_failures
        })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
