//! Job-level operator actions and metadata updates.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::Result;
use crate::model::{ExternalEndpoint, JobId, JobPriority, JobStatus, GENERIC_INFO_START_AT};
use crate::traits::SchedulerEvent;

use super::LifecycleEngine;

impl LifecycleEngine {
    /// Holds a job: nothing of it is scheduled until it is resumed.
    /// Running tasks keep running. Returns false when the job is gone,
    /// terminal or already paused.
    pub fn pause_job(&self, job_id: JobId) -> Result<bool> {
        let Some(mut guard) = self.registry.lock(job_id) else {
            return Ok(false);
        };
        if !guard.set_paused() {
            return Ok(false);
        }
        self.persistence.commit_job_paused_or_resumed(&guard)?;
        self.publish_job(SchedulerEvent::JobPaused, &guard);
        info!(job = %job_id, "job paused");
        Ok(true)
    }

    /// Releases a paused job back to whatever its tasks dictate.
    pub fn resume_job(&self, job_id: JobId) -> Result<bool> {
        let Some(mut guard) = self.registry.lock(job_id) else {
            return Ok(false);
        };
        let Some(status) = guard.set_resumed() else {
            return Ok(false);
        };
        self.persistence.commit_job_paused_or_resumed(&guard)?;
        self.publish_job(SchedulerEvent::JobResumed, &guard);
        info!(job = %job_id, status = %status, "job resumed");
        Ok(true)
    }

    /// Resumes every paused job, returning how many moved.
    pub fn resume_all_paused(&self) -> Result<usize> {
        let mut resumed = 0;
        for (job_id, status, _) in self.registry.snapshot() {
            if status != JobStatus::Paused {
                continue;
            }
            if self.resume_job(job_id)? {
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    /// Changes the scheduling priority of a live job.
    pub fn change_job_priority(&self, job_id: JobId, priority: JobPriority) -> Result<bool> {
        let Some(mut guard) = self.registry.lock(job_id) else {
            return Ok(false);
        };
        if guard.status.is_terminal() {
            return Ok(false);
        }
        guard.priority = priority;
        self.persistence.commit_job_priority_changed(&guard)?;
        self.publish_job(SchedulerEvent::JobPriorityChanged, &guard);
        self.publish_job_full(&guard);
        info!(job = %job_id, %priority, "job priority changed");
        Ok(true)
    }

    /// Moves the planned start of a pending job. Tasks not yet
    /// scheduled inherit the new time. Returns false when the job
    /// already carries that exact start or is past pending.
    pub fn update_start_at(&self, job_id: JobId, start_at: DateTime<Utc>) -> Result<bool> {
        let Some(mut guard) = self.registry.lock(job_id) else {
            return Ok(false);
        };
        if guard.status != JobStatus::Pending {
            return Ok(false);
        }
        let encoded = start_at.to_rfc3339();
        if guard.generic_info.get(GENERIC_INFO_START_AT) == Some(&encoded) {
            return Ok(false);
        }
        guard.start_at = Some(start_at);
        guard
            .generic_info
            .insert(GENERIC_INFO_START_AT.to_string(), encoded);
        for task in guard.tasks.values_mut() {
            if task.status.is_schedulable() {
                task.scheduled_at = Some(start_at);
            }
        }
        self.persistence.commit_start_at_changed(&guard)?;
        self.publish_job(SchedulerEvent::JobUpdated, &guard);
        info!(job = %job_id, start_at = %start_at, "job start time updated");
        Ok(true)
    }

    /// Attaches a service instance to the job.
    pub fn register_service(
        &self,
        job_id: JobId,
        instance_id: u32,
        enable_actions: bool,
    ) -> Result<bool> {
        let Some(mut guard) = self.registry.lock(job_id) else {
            return Ok(false);
        };
        guard.attached_services.insert(instance_id, enable_actions);
        self.persistence.commit_attached_services_changed(&guard)?;
        self.publish_job_full(&guard);
        info!(job = %job_id, service = instance_id, "service attached");
        Ok(true)
    }

    /// Detaches a service instance. Returns false when it was not
    /// attached.
    pub fn detach_service(&self, job_id: JobId, instance_id: u32) -> Result<bool> {
        let Some(mut guard) = self.registry.lock(job_id) else {
            return Ok(false);
        };
        if guard.attached_services.remove(&instance_id).is_none() {
            return Ok(false);
        }
        self.persistence.commit_attached_services_changed(&guard)?;
        self.publish_job_full(&guard);
        info!(job = %job_id, service = instance_id, "service detached");
        Ok(true)
    }

    /// Publishes an endpoint under the job, replacing any previous one
    /// with the same name.
    pub fn add_external_endpoint(
        &self,
        job_id: JobId,
        name: impl Into<String>,
        url: impl Into<String>,
        icon: Option<String>,
    ) -> Result<bool> {
        let Some(mut guard) = self.registry.lock(job_id) else {
            return Ok(false);
        };
        guard.external_endpoints.insert(
            name.into(),
            ExternalEndpoint {
                url: url.into(),
                icon,
            },
        );
        self.persistence.commit_external_endpoints_changed(&guard)?;
        self.publish_job_full(&guard);
        Ok(true)
    }

    /// Removes a named endpoint. Returns false when it did not exist.
    pub fn remove_external_endpoint(&self, job_id: JobId, name: &str) -> Result<bool> {
        let Some(mut guard) = self.registry.lock(job_id) else {
            return Ok(false);
        };
        if guard.external_endpoints.remove(name).is_none() {
            return Ok(false);
        }
        self.persistence.commit_external_endpoints_changed(&guard)?;
        self.publish_job_full(&guard);
        Ok(true)
    }

    /// Counts one more child job spawned from this one.
    pub fn increment_children_count(&self, job_id: JobId) -> Result<bool> {
        let Some(mut guard) = self.registry.lock(job_id) else {
            return Ok(false);
        };
        guard.children_count += 1;
        self.persistence.commit_children_count_changed(&guard)?;
        self.publish_job(SchedulerEvent::JobUpdated, &guard);
        Ok(true)
    }
}
