//! Terminal transitions: tasks reaching a terminal state, jobs leaving
//! the live set, and the bookkeeping both share.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};
use crate::model::{JobId, JobRecord, JobStatus, TaskId, TaskOutcome, TaskStatus};
use crate::registry::JobGuard;
use crate::running::RunningTask;
use crate::termination::{ReleaseCause, TerminationBatch};
use crate::traits::SchedulerEvent;

use super::LifecycleEngine;

impl LifecycleEngine {
    /// Applies a terminal status to one task and settles the job
    /// around it. When this was the last live task the whole job is
    /// finalized and leaves the registry.
    pub(super) fn finalize_terminated_task(
        &self,
        guard: &mut JobGuard,
        task_id: TaskId,
        status: TaskStatus,
        outcome: Option<TaskOutcome>,
        event: SchedulerEvent,
        batch: &mut TerminationBatch,
    ) -> Result<()> {
        debug_assert!(status.is_terminal());
        let now = Utc::now();
        let (is_precious, merged_results) = {
            let Some(task) = guard.task_mut(task_id) else {
                return Err(SchedulerError::UnknownTask(task_id));
            };
            task.status = status;
            task.finished_at = Some(now);
            task.in_error_since = None;
            task.placement = None;
            task.parent_results.clear();
            if let Some(outcome) = outcome {
                task.result = Some(outcome);
            }
            let merged = if status == TaskStatus::Finished {
                task.result
                    .as_ref()
                    .map(|result| result.result_map.clone())
                    .unwrap_or_default()
            } else {
                HashMap::new()
            };
            (task.precious, merged)
        };
        if is_precious && status == TaskStatus::Finished {
            guard.precious_tasks.push(task_id);
        }
        guard.result_map.extend(merged_results);
        guard.recount();
        let flipped = guard.refresh_error_status(now);
        guard.stall_if_idle();

        if guard.is_finished() {
            return self.finalize_job(guard, task_id, event, batch);
        }

        if let Some(task) = guard.task(task_id) {
            self.persistence.commit_task_finished(guard, task)?;
            self.publish_task(event, task);
        }
        match flipped {
            Some(JobStatus::InError) => self.publish_job(SchedulerEvent::JobInError, guard),
            Some(_) => self.publish_job(SchedulerEvent::JobUpdated, guard),
            None => {}
        }
        Ok(())
    }

    /// Clean completion: the last task just went terminal.
    fn finalize_job(
        &self,
        guard: &mut JobGuard,
        last_task: TaskId,
        event: SchedulerEvent,
        batch: &mut TerminationBatch,
    ) -> Result<()> {
        let now = Utc::now();
        let was_started = guard.started_at.is_some();
        guard.terminate(now);
        let has_errors = self.job_with_errors(guard);
        batch.add_terminated_job(guard, has_errors);
        self.clean_job_signals(guard.id());
        self.registry.evict(guard);
        if let Some(task) = guard.task(last_task) {
            self.persistence.commit_task_finished(guard, task)?;
            self.publish_task(event, task);
        }
        let job_event = if was_started {
            SchedulerEvent::JobRunningToFinished
        } else {
            SchedulerEvent::JobPendingToFinished
        };
        self.publish_job(job_event, guard);
        info!(job = %guard.id(), has_errors, "job finished");
        Ok(())
    }

    /// Forcibly ends a job: releases every running execution, aborts
    /// every live task and removes the job from the registry.
    pub(super) fn end_job(
        &self,
        guard: &mut JobGuard,
        status: JobStatus,
        culprit: Option<TaskId>,
        reason: &str,
        batch: &mut TerminationBatch,
    ) -> Result<()> {
        let now = Utc::now();
        for handle in self.running.drain_job(guard.id()) {
            self.note_nodes_released(guard, &handle);
            self.charge_core_time(guard, handle.task_id);
            batch.add_released(guard.id(), handle, ReleaseCause::Aborted, None);
        }
        let was_started = guard.started_at.is_some();
        let changed = guard.force_terminate(status, culprit, now);
        let has_errors = self.job_with_errors(guard);
        batch.add_terminated_job(guard, has_errors);
        self.clean_job_signals(guard.id());
        self.registry.evict(guard);
        self.persistence.commit_job_killed(guard)?;
        for task_id in changed {
            if let Some(task) = guard.task(task_id) {
                self.publish_task(SchedulerEvent::TaskRunningToFinished, task);
            }
        }
        let job_event = if was_started {
            SchedulerEvent::JobRunningToFinished
        } else {
            SchedulerEvent::JobPendingToFinished
        };
        self.publish_job(job_event, guard);
        info!(job = %guard.id(), status = %status, reason, "job ended");
        Ok(())
    }

    /// Kills a job outright. Jobs already gone are a no-op.
    pub fn kill_job(&self, job_id: JobId, reason: &str) -> Result<TerminationBatch> {
        let mut batch = TerminationBatch::new();
        let Some(mut guard) = self.registry.lock(job_id) else {
            debug!(job = %job_id, "kill for a job no longer live");
            return Ok(batch);
        };
        self.end_job(&mut guard, JobStatus::Killed, None, reason, &mut batch)?;
        Ok(batch)
    }

    /// Kills a set of jobs, folding every effect into one batch.
    pub fn kill_jobs(&self, job_ids: &[JobId], reason: &str) -> Result<TerminationBatch> {
        let mut batch = TerminationBatch::new();
        for mut guard in self.registry.lock_many(job_ids) {
            self.end_job(&mut guard, JobStatus::Killed, None, reason, &mut batch)?;
        }
        Ok(batch)
    }

    /// Operator removal of a live job. The job is ended like a kill
    /// and leaves the registry immediately.
    pub fn remove_job(&self, job_id: JobId) -> Result<TerminationBatch> {
        let mut batch = TerminationBatch::new();
        let Some(mut guard) = self.registry.lock(job_id) else {
            return Ok(batch);
        };
        self.end_job(
            &mut guard,
            JobStatus::Killed,
            None,
            "removed by operator",
            &mut batch,
        )?;
        info!(job = %job_id, "job removed");
        Ok(batch)
    }

    /// Whether the job terminated with errors, as reported to
    /// termination listeners.
    pub fn job_with_errors(&self, job: &JobRecord) -> bool {
        match job.status {
            JobStatus::Failed | JobStatus::Canceled => true,
            JobStatus::Killed => self.config.kill_counts_as_errors,
            _ => job.counts.faulty > 0 || job.counts.failed > 0,
        }
    }

    fn clean_job_signals(&self, job_id: JobId) {
        let channel = self.config.signal_channel(job_id);
        match self.signals.channel_exists(&channel) {
            Ok(true) => {
                if let Err(err) = self.signals.delete_channel(&channel) {
                    warn!(job = %job_id, %err, "signal channel cleanup failed");
                }
            }
            Ok(false) => {}
            Err(err) => warn!(job = %job_id, %err, "signal channel lookup failed"),
        }
    }

    pub(super) fn note_nodes_released(&self, guard: &mut JobGuard, handle: &RunningTask) {
        let released = handle.launcher.node_ids.len() as u64;
        guard.nodes_in_parallel = guard.nodes_in_parallel.saturating_sub(released);
    }

    /// Adds the wall time of the task's current execution to the job.
    pub(super) fn charge_core_time(&self, guard: &mut JobGuard, task_id: TaskId) {
        let started = guard.task(task_id).and_then(|task| task.started_at);
        if let Some(started) = started {
            let elapsed = (Utc::now() - started).to_std().unwrap_or_default();
            guard.cumulated_core_time = guard.cumulated_core_time.saturating_add(elapsed);
        }
    }
}
