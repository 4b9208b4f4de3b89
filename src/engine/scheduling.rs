//! Entry point of the scheduling pass: locking the jobs worth
//! offering to the dispatcher, without ever blocking on one.

use tracing::debug;

use crate::model::{JobPriority, JobStatus};
use crate::registry::{JobGuard, TryLockJob};

use super::LifecycleEngine;

/// Jobs locked for one scheduling pass. Dropping the batch releases
/// every guard.
#[derive(Debug, Default)]
pub struct SchedulingBatch {
    guards: Vec<JobGuard>,
}

impl SchedulingBatch {
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn guards(&self) -> &[JobGuard] {
        &self.guards
    }

    pub fn guards_mut(&mut self) -> &mut [JobGuard] {
        &mut self.guards
    }

    pub fn into_guards(self) -> Vec<JobGuard> {
        self.guards
    }
}

impl LifecycleEngine {
    /// Locks every job the next dispatch pass should look at.
    ///
    /// Candidates are filtered on the lock-free mirrors, then taken
    /// with non-blocking locks and re-checked under the lock. If a job
    /// we could not lock outranks one we did lock, the whole batch is
    /// abandoned: scheduling around the missing job would serve lower
    /// priority work first.
    ///
    /// While the scheduler is paused only jobs already in progress are
    /// offered, so running work can drain without new jobs starting.
    pub fn lock_jobs_to_schedule(&self, scheduler_paused: bool) -> SchedulingBatch {
        let eligible = |status: JobStatus| {
            if scheduler_paused {
                status.is_in_progress()
            } else {
                matches!(
                    status,
                    JobStatus::Pending | JobStatus::Running | JobStatus::Stalled
                )
            }
        };

        let mut guards = Vec::new();
        let mut top_contended: Option<JobPriority> = None;
        for (job_id, status, _) in self.registry.snapshot() {
            if !eligible(status) {
                continue;
            }
            match self.registry.try_lock(job_id) {
                TryLockJob::Locked(guard) => {
                    // The mirror may lag; the record decides.
                    if eligible(guard.status) {
                        guards.push(guard);
                    }
                }
                TryLockJob::Contended(priority) => {
                    top_contended = Some(top_contended.map_or(priority, |top| top.max(priority)));
                }
                TryLockJob::Absent => {}
            }
        }

        if let Some(contended) = top_contended {
            if guards.iter().any(|guard| contended > guard.priority) {
                debug!(%contended, abandoned = guards.len(), "scheduling pass yields to a contended job");
                return SchedulingBatch::default();
            }
        }
        SchedulingBatch { guards }
    }
}
