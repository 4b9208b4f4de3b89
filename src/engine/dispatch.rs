//! Dispatch-side transitions: tasks starting on their nodes, and the
//! cleanup when a dispatch attempt falls apart.

use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{Result, SchedulerError};
use crate::model::{JobStatus, LauncherRef, TaskId, TaskStatus};
use crate::registry::JobGuard;
use crate::running::RunningTask;
use crate::termination::TerminationBatch;
use crate::traits::SchedulerEvent;

use super::LifecycleEngine;

impl LifecycleEngine {
    /// Records a task starting on its launcher. The caller already
    /// holds the job, normally through a scheduling batch.
    pub fn task_started(
        &self,
        guard: &mut JobGuard,
        task_id: TaskId,
        launcher: LauncherRef,
    ) -> Result<()> {
        if self.running.contains(task_id) {
            return Err(SchedulerError::TaskAlreadyRunning(task_id));
        }
        let now = Utc::now();
        let owner = guard.owner.clone();
        let credentials = guard.credentials.clone();
        let node_count = launcher.node_ids.len() as u64;

        let attempt = {
            let task = guard
                .task_mut(task_id)
                .ok_or(SchedulerError::UnknownTask(task_id))?;
            if task.status == TaskStatus::Running {
                return Err(SchedulerError::TaskAlreadyRunning(task_id));
            }
            if !task.status.is_schedulable() {
                return Err(SchedulerError::TaskNotSchedulable(task_id));
            }
            task.begin_execution(launcher.clone(), now);
            task.current_attempt()
        };
        self.running.insert(RunningTask::new(
            task_id,
            owner,
            credentials,
            launcher,
            attempt,
        ));

        guard.nodes_used += node_count;
        guard.nodes_in_parallel += node_count;
        guard.recount();
        let started_now = guard.start(now);
        if guard.status == JobStatus::Stalled {
            guard.status = JobStatus::Running;
        }

        if let Some(task) = guard.task(task_id) {
            self.persistence.commit_task_started(guard, task)?;
        }
        if started_now {
            self.publish_job(SchedulerEvent::JobPendingToRunning, guard);
        }
        if let Some(task) = guard.task(task_id) {
            self.publish_task(SchedulerEvent::TaskPendingToRunning, task);
        }
        info!(task = %task_id, attempt, nodes = node_count, "task started");
        Ok(())
    }

    /// Cancels every job that had a task in a failed dispatch, each
    /// with its task as the culprit. Jobs already gone are skipped.
    ///
    /// A job that never ran is started first so listeners see a
    /// consistent pending-to-running-to-cancelled sequence.
    pub fn cancel_jobs_on_dispatch_failure(
        &self,
        task_ids: &[TaskId],
        reason: &str,
    ) -> Result<TerminationBatch> {
        let mut batch = TerminationBatch::new();
        let mut seen = HashSet::new();
        for task_id in task_ids {
            if !seen.insert(task_id.job) {
                continue;
            }
            let Some(mut guard) = self.registry.lock(task_id.job) else {
                debug!(job = %task_id.job, "dispatch-failed job no longer live");
                continue;
            };
            if guard.start(Utc::now()) {
                self.publish_job(SchedulerEvent::JobPendingToRunning, &guard);
            }
            self.end_job(
                &mut guard,
                JobStatus::Canceled,
                Some(*task_id),
                reason,
                &mut batch,
            )?;
        }
        Ok(batch)
    }
}
