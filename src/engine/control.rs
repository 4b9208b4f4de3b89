//! Operator actions on single tasks: kill, preempt, restart, and the
//! two ways out of the in-error parking lot.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{Result, SchedulerError};
use crate::model::{JobId, JobStatus, OnTaskError, TaskId, TaskOutcome, TaskStatus};
use crate::policy::{decide_on_error, ErrorHandling};
use crate::termination::{ReleaseCause, TerminationBatch};
use crate::traits::SchedulerEvent;

use super::LifecycleEngine;

impl LifecycleEngine {
    /// Kills one task wherever it stands, without charging an
    /// execution. A cancelling error policy widens this into a job
    /// cancel with the task as culprit.
    pub fn kill_task(&self, task_id: TaskId, reason: &str) -> Result<TerminationBatch> {
        let mut batch = TerminationBatch::new();
        let Some(mut guard) = self.registry.lock(task_id.job) else {
            debug!(task = %task_id, "kill for a job no longer live");
            return Ok(batch);
        };
        let status = guard
            .task(task_id)
            .ok_or(SchedulerError::UnknownTask(task_id))?
            .status;
        if status.is_terminal() {
            return Ok(batch);
        }
        if let Some(handle) = self.running.remove(task_id) {
            self.note_nodes_released(&mut guard, &handle);
            self.charge_core_time(&mut guard, task_id);
            batch.add_released(guard.id(), handle, ReleaseCause::Aborted, None);
        }
        let outcome = TaskOutcome::failure(reason);
        let cancels_job = guard
            .task(task_id)
            .map(|task| task.on_error == OnTaskError::CancelJob)
            .unwrap_or(false);
        if cancels_job {
            if let Some(task) = guard.task_mut(task_id) {
                task.result = Some(outcome);
            }
            self.end_job(
                &mut guard,
                JobStatus::Canceled,
                Some(task_id),
                reason,
                &mut batch,
            )?;
        } else {
            self.finalize_terminated_task(
                &mut guard,
                task_id,
                TaskStatus::Aborted,
                Some(outcome),
                SchedulerEvent::TaskRunningToFinished,
                &mut batch,
            )?;
        }
        info!(task = %task_id, reason, "task killed");
        Ok(batch)
    }

    /// Takes a running task off its nodes and requeues it after the
    /// delay. The interrupted attempt is not charged.
    pub fn preempt_task(&self, task_id: TaskId, delay: Duration) -> Result<TerminationBatch> {
        let mut batch = TerminationBatch::new();
        let Some(mut guard) = self.registry.lock(task_id.job) else {
            return Ok(batch);
        };
        {
            let task = guard
                .task(task_id)
                .ok_or(SchedulerError::UnknownTask(task_id))?;
            if task.status != TaskStatus::Running {
                return Ok(batch);
            }
        }
        let handle = self
            .running
            .remove(task_id)
            .ok_or(SchedulerError::TaskNotRunning(task_id))?;
        self.note_nodes_released(&mut guard, &handle);
        self.charge_core_time(&mut guard, task_id);
        let avoid = handle.launcher.node_ids.clone();
        batch.add_released(guard.id(), handle, ReleaseCause::Aborted, None);
        self.queue_retry(
            &mut guard,
            task_id,
            TaskStatus::WaitingOnError,
            &avoid,
            delay,
            None,
            &mut batch,
        )?;
        info!(task = %task_id, "task preempted");
        Ok(batch)
    }

    /// Operator restart of a running task. Unlike preemption this
    /// charges the interrupted attempt, so it can exhaust the budget.
    pub fn restart_task(&self, task_id: TaskId, delay: Duration) -> Result<TerminationBatch> {
        let mut batch = TerminationBatch::new();
        let Some(mut guard) = self.registry.lock(task_id.job) else {
            return Ok(batch);
        };
        {
            let task = guard
                .task(task_id)
                .ok_or(SchedulerError::UnknownTask(task_id))?;
            if task.status != TaskStatus::Running {
                return Ok(batch);
            }
        }
        let handle = self
            .running
            .remove(task_id)
            .ok_or(SchedulerError::TaskNotRunning(task_id))?;
        self.note_nodes_released(&mut guard, &handle);
        self.charge_core_time(&mut guard, task_id);
        let avoid = handle.launcher.node_ids.clone();
        batch.add_released(guard.id(), handle, ReleaseCause::Aborted, None);

        let decision = {
            let Some(task) = guard.task_mut(task_id) else {
                return Err(SchedulerError::UnknownTask(task_id));
            };
            task.executions_left = task.executions_left.saturating_sub(1);
            decide_on_error(task, self.backoff.as_ref())
        };
        match decision {
            ErrorHandling::CancelJob => {
                self.end_job(
                    &mut guard,
                    JobStatus::Canceled,
                    Some(task_id),
                    "task restarted with a cancelling policy and no executions left",
                    &mut batch,
                )?;
            }
            ErrorHandling::RetryAfterDelay(_) => {
                self.queue_retry(
                    &mut guard,
                    task_id,
                    TaskStatus::WaitingOnError,
                    &avoid,
                    delay,
                    None,
                    &mut batch,
                )?;
            }
            ErrorHandling::PauseTask | ErrorHandling::PauseJob | ErrorHandling::Exhausted => {
                self.finalize_terminated_task(
                    &mut guard,
                    task_id,
                    TaskStatus::Aborted,
                    Some(TaskOutcome::failure("restarted with no executions left")),
                    SchedulerEvent::TaskRunningToFinished,
                    &mut batch,
                )?;
            }
        }
        info!(task = %task_id, "task restarted by operator");
        Ok(batch)
    }

    /// Finishes an in-error task with the result its last execution
    /// left behind.
    pub fn finish_in_error_task(&self, task_id: TaskId) -> Result<TerminationBatch> {
        let mut batch = TerminationBatch::new();
        let Some(mut guard) = self.registry.lock(task_id.job) else {
            return Ok(batch);
        };
        let (status, outcome) = {
            let task = guard
                .task(task_id)
                .ok_or(SchedulerError::UnknownTask(task_id))?;
            (task.status, task.result.clone())
        };
        if status != TaskStatus::InError {
            return Ok(batch);
        }
        self.finalize_terminated_task(
            &mut guard,
            task_id,
            TaskStatus::Finished,
            outcome,
            SchedulerEvent::TaskInErrorToFinished,
            &mut batch,
        )?;
        info!(task = %task_id, "in-error task finished");
        Ok(batch)
    }

    /// Puts an in-error task straight back in the queue.
    pub fn restart_in_error_task(&self, task_id: TaskId) -> Result<bool> {
        let Some(mut guard) = self.registry.lock(task_id.job) else {
            return Ok(false);
        };
        let now = Utc::now();
        {
            let Some(task) = guard.task_mut(task_id) else {
                return Err(SchedulerError::UnknownTask(task_id));
            };
            if task.status != TaskStatus::InError {
                return Ok(false);
            }
            task.status = TaskStatus::Pending;
            task.in_error_since = None;
            task.scheduled_at = Some(now);
        }
        guard.recount();
        let flipped = guard.refresh_error_status(now);
        guard.stall_if_idle();
        if let Some(task) = guard.task(task_id) {
            self.persistence.commit_task_restarted(&guard, task)?;
            self.publish_task(SchedulerEvent::TaskWaitingForRestart, task);
        }
        if flipped == Some(JobStatus::Running) {
            self.publish_job(SchedulerEvent::JobRestartedFromError, &guard);
        }
        info!(task = %task_id, "in-error task restarted");
        Ok(true)
    }

    /// Restarts every in-error task of a job at once. Returns true
    /// when at least one task moved.
    pub fn restart_all_in_error_tasks(&self, job_id: JobId) -> Result<bool> {
        let Some(mut guard) = self.registry.lock(job_id) else {
            return Ok(false);
        };
        let now = Utc::now();
        let in_error: Vec<TaskId> = guard
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::InError)
            .map(|task| task.id)
            .collect();
        if in_error.is_empty() {
            return Ok(false);
        }
        for id in &in_error {
            if let Some(task) = guard.task_mut(*id) {
                task.status = TaskStatus::Pending;
                task.in_error_since = None;
                task.scheduled_at = Some(now);
            }
        }
        guard.recount();
        let flipped = guard.refresh_error_status(now);
        guard.stall_if_idle();
        for id in &in_error {
            if let Some(task) = guard.task(*id) {
                self.persistence.commit_task_restarted(&guard, task)?;
                self.publish_task(SchedulerEvent::TaskWaitingForRestart, task);
            }
        }
        if flipped == Some(JobStatus::Running) {
            self.publish_job(SchedulerEvent::JobRestartedFromError, &guard);
        }
        info!(job = %job_id, count = in_error.len(), "in-error tasks restarted");
        Ok(true)
    }
}
