//! Outcomes coming back from nodes: results, execution errors and
//! node failures under running tasks.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{Result, SchedulerError};
use crate::model::{JobStatus, RestartMode, TaskId, TaskOutcome, TaskStatus};
use crate::policy::{decide_on_error, decide_on_node_failure, ErrorHandling, NodeFailureHandling};
use crate::registry::JobGuard;
use crate::termination::{ReleaseCause, TerminationBatch};
use crate::traits::SchedulerEvent;

use super::LifecycleEngine;

impl LifecycleEngine {
    /// Settles a finished execution. `attempt` names the execution the
    /// outcome belongs to; a result from a superseded attempt is
    /// dropped so it cannot clobber the one currently running.
    ///
    /// A successful outcome finishes the task. An error consumes one
    /// execution from the budget and routes through the error policy.
    pub fn task_terminated_with_result(
        &self,
        task_id: TaskId,
        attempt: u32,
        outcome: TaskOutcome,
    ) -> Result<TerminationBatch> {
        let mut batch = TerminationBatch::new();
        let Some(mut guard) = self.registry.lock(task_id.job) else {
            debug!(task = %task_id, "result for a job no longer live");
            return Ok(batch);
        };
        {
            let task = guard
                .task(task_id)
                .ok_or(SchedulerError::UnknownTask(task_id))?;
            if task.status != TaskStatus::Running {
                debug!(task = %task_id, status = %task.status, "result for a task not running");
                return Ok(batch);
            }
        }
        if !self.running.is_current(task_id, attempt) {
            debug!(task = %task_id, attempt, "result from a superseded attempt");
            return Ok(batch);
        }
        let handle = self
            .running
            .remove(task_id)
            .ok_or(SchedulerError::TaskNotRunning(task_id))?;
        self.note_nodes_released(&mut guard, &handle);
        self.charge_core_time(&mut guard, task_id);

        if !outcome.had_error() {
            batch.add_released(
                guard.id(),
                handle,
                ReleaseCause::Normal,
                Some(outcome.clone()),
            );
            self.finalize_terminated_task(
                &mut guard,
                task_id,
                TaskStatus::Finished,
                Some(outcome),
                SchedulerEvent::TaskRunningToFinished,
                &mut batch,
            )?;
            return Ok(batch);
        }

        let avoid = handle.launcher.node_ids.clone();
        batch.add_released(
            guard.id(),
            handle,
            ReleaseCause::Normal,
            Some(outcome.clone()),
        );
        let decision = {
            let Some(task) = guard.task_mut(task_id) else {
                return Err(SchedulerError::UnknownTask(task_id));
            };
            task.executions_left = task.executions_left.saturating_sub(1);
            decide_on_error(task, self.backoff.as_ref())
        };
        info!(task = %task_id, attempt, decision = ?decision, "task ended in error");
        match decision {
            ErrorHandling::CancelJob => {
                if let Some(task) = guard.task_mut(task_id) {
                    task.result = Some(outcome.clone());
                }
                let reason = outcome
                    .error
                    .unwrap_or_else(|| "task error cancelled the job".to_string());
                self.end_job(
                    &mut guard,
                    JobStatus::Canceled,
                    Some(task_id),
                    &reason,
                    &mut batch,
                )?;
            }
            ErrorHandling::RetryAfterDelay(delay) => {
                self.queue_retry(
                    &mut guard,
                    task_id,
                    TaskStatus::WaitingOnError,
                    &avoid,
                    delay,
                    Some(outcome),
                    &mut batch,
                )?;
            }
            ErrorHandling::PauseTask => {
                self.suspend_task_on_error(&mut guard, task_id, outcome)?;
            }
            ErrorHandling::PauseJob => {
                self.suspend_task_on_error(&mut guard, task_id, outcome)?;
                if guard.set_paused() {
                    self.persistence.commit_job_paused_or_resumed(&guard)?;
                    self.publish_job(SchedulerEvent::JobPaused, &guard);
                }
            }
            ErrorHandling::Exhausted => {
                self.finalize_terminated_task(
                    &mut guard,
                    task_id,
                    TaskStatus::Faulty,
                    Some(outcome),
                    SchedulerEvent::TaskRunningToFinished,
                    &mut batch,
                )?;
            }
        }
        Ok(batch)
    }

    /// Handles a node dying under a running task. The attempt is not
    /// charged; the node-failure budget is. `attempt` guards against
    /// stale reports the same way results are guarded.
    pub fn restart_task_on_node_failure(
        &self,
        task_id: TaskId,
        attempt: u32,
    ) -> Result<TerminationBatch> {
        let mut batch = TerminationBatch::new();
        let Some(mut guard) = self.registry.lock(task_id.job) else {
            debug!(task = %task_id, "node failure for a job no longer live");
            return Ok(batch);
        };
        {
            let task = guard
                .task(task_id)
                .ok_or(SchedulerError::UnknownTask(task_id))?;
            if task.status != TaskStatus::Running {
                debug!(task = %task_id, status = %task.status, "node failure for a task not running");
                return Ok(batch);
            }
        }
        if !self.running.is_current(task_id, attempt) {
            debug!(task = %task_id, attempt, "node failure report from a superseded attempt");
            return Ok(batch);
        }
        let handle = self
            .running
            .remove(task_id)
            .ok_or(SchedulerError::TaskNotRunning(task_id))?;
        self.note_nodes_released(&mut guard, &handle);
        batch.add_released(guard.id(), handle, ReleaseCause::NodeFailed, None);

        let decision = {
            let Some(task) = guard.task_mut(task_id) else {
                return Err(SchedulerError::UnknownTask(task_id));
            };
            task.node_failures_left = task.node_failures_left.saturating_sub(1);
            decide_on_node_failure(task)
        };
        info!(task = %task_id, attempt, decision = ?decision, "node failed under task");
        match decision {
            NodeFailureHandling::Requeue => {
                self.queue_retry(
                    &mut guard,
                    task_id,
                    TaskStatus::WaitingOnFailure,
                    &[],
                    Duration::ZERO,
                    None,
                    &mut batch,
                )?;
            }
            NodeFailureHandling::FailJob => {
                self.end_job(
                    &mut guard,
                    JobStatus::Failed,
                    Some(task_id),
                    "task ran out of node failures",
                    &mut batch,
                )?;
            }
        }
        Ok(batch)
    }

    /// Moves a waiting task back to the queue once its restart delay
    /// elapsed. Returns false when the task is not waiting anymore.
    pub fn restart_waiting_task(&self, task_id: TaskId) -> Result<bool> {
        let Some(mut guard) = self.registry.lock(task_id.job) else {
            return Ok(false);
        };
        let now = Utc::now();
        {
            let Some(task) = guard.task_mut(task_id) else {
                return Err(SchedulerError::UnknownTask(task_id));
            };
            if !task.status.is_waiting() {
                return Ok(false);
            }
            task.status = TaskStatus::Pending;
            task.scheduled_at = Some(now);
        }
        guard.recount();
        if let Some(task) = guard.task(task_id) {
            self.persistence.commit_task_restarted(&guard, task)?;
        }
        debug!(task = %task_id, "waiting task returned to the queue");
        Ok(true)
    }

    /// Parks the task in a waiting state and schedules its return.
    pub(super) fn queue_retry(
        &self,
        guard: &mut JobGuard,
        task_id: TaskId,
        waiting: TaskStatus,
        avoid_nodes: &[u64],
        delay: Duration,
        result: Option<TaskOutcome>,
        batch: &mut TerminationBatch,
    ) -> Result<()> {
        debug_assert!(waiting.is_waiting());
        let had_result = result.is_some();
        {
            let Some(task) = guard.task_mut(task_id) else {
                return Err(SchedulerError::UnknownTask(task_id));
            };
            task.status = waiting;
            task.progress = 0;
            task.placement = None;
            if task.restart_mode == RestartMode::Elsewhere {
                task.excluded_nodes.extend(avoid_nodes.iter().copied());
            }
            if let Some(outcome) = result {
                task.result = Some(outcome);
            }
        }
        guard.recount();
        guard.stall_if_idle();
        batch.add_delayed_restart(task_id, delay);
        if let Some(task) = guard.task(task_id) {
            // An errored attempt leaves a result worth persisting; a
            // node failure leaves none.
            if had_result {
                self.persistence.commit_task_finished(guard, task)?;
            } else {
                self.persistence.commit_task_restarted(guard, task)?;
            }
            self.publish_task(SchedulerEvent::TaskWaitingForRestart, task);
        }
        debug!(
            task = %task_id,
            status = %waiting,
            delay_ms = delay.as_millis() as u64,
            "task queued for restart"
        );
        Ok(())
    }

    /// Parks the task in error, waiting for an operator.
    pub(super) fn suspend_task_on_error(
        &self,
        guard: &mut JobGuard,
        task_id: TaskId,
        outcome: TaskOutcome,
    ) -> Result<()> {
        let now = Utc::now();
        {
            let Some(task) = guard.task_mut(task_id) else {
                return Err(SchedulerError::UnknownTask(task_id));
            };
            task.status = TaskStatus::InError;
            task.in_error_since = Some(now);
            task.placement = None;
            task.result = Some(outcome);
        }
        if guard.in_error_since.is_none() {
            guard.in_error_since = Some(now);
        }
        guard.recount();
        let flipped = guard.refresh_error_status(now);
        if let Some(task) = guard.task(task_id) {
            self.persistence.commit_task_finished(guard, task)?;
            self.publish_task(SchedulerEvent::TaskInError, task);
        }
        if flipped == Some(JobStatus::InError) {
            self.publish_job(SchedulerEvent::JobInError, guard);
        }
        info!(task = %task_id, "task suspended in error");
        Ok(())
    }
}
