//! Job-level data model: identity, priority, status machine, the record.
//!
//! Status changes follow a closed transition table. Forced terminations
//! (kill, cancel, node-failure exhaustion) go through
//! [`JobRecord::force_terminate`] so every non-terminal task is accounted
//! for in one place.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::{TaskId, TaskRecord, TaskStatus};

/// Generic-information key mirroring the requested start time.
pub const GENERIC_INFO_START_AT: &str = "START_AT";

/// Unique job identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Scheduling priority; higher values win the dispatch pass.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum JobPriority {
    Idle = 0,
    Lowest = 1,
    Low = 2,
    #[default]
    Normal = 3,
    High = 4,
    Highest = 5,
}

impl JobPriority {
    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a mirror value. Mirrors only ever hold values produced
    /// by [`as_u8`](Self::as_u8); anything else decodes as `Normal`.
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => JobPriority::Idle,
            1 => JobPriority::Lowest,
            2 => JobPriority::Low,
            4 => JobPriority::High,
            5 => JobPriority::Highest,
            _ => JobPriority::Normal,
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobPriority::Idle => "idle",
            JobPriority::Lowest => "lowest",
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
            JobPriority::Highest => "highest",
        };
        f.write_str(s)
    }
}

/// Lifecycle states of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobStatus {
    /// Submitted, no task started yet.
    Pending = 0,
    /// At least one task has started.
    Running = 1,
    /// Started, but nothing is currently executing.
    Stalled = 2,
    /// Held by an operator. Automatic error handling never clears this.
    Paused = 3,
    /// Carrying suspended tasks, waiting for an operator.
    InError = 4,
    /// Terminated because a task's error policy cancelled it.
    Canceled = 5,
    /// Terminated after a task ran out of node-failure retries.
    Failed = 6,
    /// Terminated by an explicit kill.
    Killed = 7,
    /// Every task reached a terminal outcome.
    Finished = 8,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Canceled | JobStatus::Failed | JobStatus::Killed | JobStatus::Finished
        )
    }

    pub fn is_alive(self) -> bool {
        !self.is_terminal()
    }

    /// Started and not held back; the only states the scheduling pass
    /// still serves while the scheduler itself is paused.
    pub fn is_in_progress(self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Stalled)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Pending => matches!(next, Running | Paused | Canceled | Failed | Killed | Finished),
            Running => matches!(
                next,
                Stalled | Paused | InError | Canceled | Failed | Killed | Finished
            ),
            Stalled => matches!(
                next,
                Running | Paused | InError | Canceled | Failed | Killed | Finished
            ),
            Paused => matches!(
                next,
                Pending | Running | Stalled | Canceled | Failed | Killed | Finished
            ),
            InError => matches!(
                next,
                Running | Stalled | Paused | Canceled | Failed | Killed | Finished
            ),
            Canceled | Failed | Killed | Finished => false,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a mirror value. Mirrors only ever hold values produced
    /// by [`as_u8`](Self::as_u8); anything else decodes as `Pending`.
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => JobStatus::Running,
            2 => JobStatus::Stalled,
            3 => JobStatus::Paused,
            4 => JobStatus::InError,
            5 => JobStatus::Canceled,
            6 => JobStatus::Failed,
            7 => JobStatus::Killed,
            8 => JobStatus::Finished,
            _ => JobStatus::Pending,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Stalled => "stalled",
            JobStatus::Paused => "paused",
            JobStatus::InError => "in-error",
            JobStatus::Canceled => "canceled",
            JobStatus::Failed => "failed",
            JobStatus::Killed => "killed",
            JobStatus::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// Per-status task counters, recomputed from the task table.
///
/// Aborted and skipped tasks stay out of the named buckets, so the
/// classified sum can only fall short of the total, never exceed it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: u32,
    pub pending: u32,
    pub running: u32,
    pub finished: u32,
    pub faulty: u32,
    pub failed: u32,
    pub in_error: u32,
}

impl TaskCounts {
    pub fn consistent(&self) -> bool {
        self.pending + self.running + self.finished + self.faulty + self.failed + self.in_error
            <= self.total
    }
}

/// Endpoint exposed by a running job, keyed by name in the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalEndpoint {
    pub url: String,
    pub icon: Option<String>,
}

/// Opaque credential blob travelling with the job for node-side cleanup.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials(Vec<u8>);

impl Credentials {
    pub fn new(raw: Vec<u8>) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials({} bytes)", self.0.len())
    }
}

/// Read-only job snapshot published with job events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: JobId,
    pub owner: String,
    pub tenant: Option<String>,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub counts: TaskCounts,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub in_error_since: Option<DateTime<Utc>>,
    pub start_at: Option<DateTime<Utc>>,
    pub cumulated_core_time: Duration,
    pub children_count: u32,
}

/// Mutable state of one live job. Owned by the registry and only ever
/// touched while the job's lock is held.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub owner: String,
    pub tenant: Option<String>,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub counts: TaskCounts,
    /// Nodes acquired over the whole job life.
    pub nodes_used: u64,
    /// Nodes held by live executions right now.
    pub nodes_in_parallel: u64,
    /// Wall time consumed by executions so far.
    pub cumulated_core_time: Duration,
    pub generic_info: HashMap<String, String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub in_error_since: Option<DateTime<Utc>>,
    /// Requested earliest start, mirrored in the generic information.
    pub start_at: Option<DateTime<Utc>>,
    /// Attached service instances: id to actions-enabled.
    pub attached_services: HashMap<u32, bool>,
    pub external_endpoints: HashMap<String, ExternalEndpoint>,
    /// Tasks whose results must be kept with the job.
    pub precious_tasks: Vec<TaskId>,
    pub parent_id: Option<JobId>,
    pub children_count: u32,
    pub credentials: Credentials,
    /// Keyed by task id; serialized as a plain sequence of records.
    #[serde(with = "task_table")]
    pub tasks: BTreeMap<TaskId, TaskRecord>,
    /// Key/value results merged from finished tasks.
    pub result_map: HashMap<String, String>,
}

mod task_table {
    use std::collections::BTreeMap;

    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{TaskId, TaskRecord};

    pub fn serialize<S: Serializer>(
        tasks: &BTreeMap<TaskId, TaskRecord>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(tasks.len()))?;
        for task in tasks.values() {
            seq.serialize_element(task)?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<TaskId, TaskRecord>, D::Error> {
        let tasks = Vec::<TaskRecord>::deserialize(deserializer)?;
        Ok(tasks.into_iter().map(|task| (task.id, task)).collect())
    }
}

impl JobRecord {
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            owner: owner.into(),
            tenant: None,
            status: JobStatus::Pending,
            priority: JobPriority::default(),
            counts: TaskCounts::default(),
            nodes_used: 0,
            nodes_in_parallel: 0,
            cumulated_core_time: Duration::ZERO,
            generic_info: HashMap::new(),
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            in_error_since: None,
            start_at: None,
            attached_services: HashMap::new(),
            external_endpoints: HashMap::new(),
            precious_tasks: Vec::new(),
            parent_id: None,
            children_count: 0,
            credentials: Credentials::default(),
            tasks: BTreeMap::new(),
            result_map: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_generic_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.generic_info.insert(key.into(), value.into());
        self
    }

    pub fn with_parent(mut self, parent: JobId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn with_start_at(mut self, start_at: DateTime<Utc>) -> Self {
        self.start_at = Some(start_at);
        self.generic_info
            .insert(GENERIC_INFO_START_AT.to_string(), start_at.to_rfc3339());
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Task identity for a given index within this job.
    pub fn task_id(&self, index: u32) -> TaskId {
        TaskId::new(self.id, index)
    }

    pub fn push_task(&mut self, task: TaskRecord) {
        debug_assert_eq!(task.id.job, self.id, "task registered under a foreign job");
        self.tasks.insert(task.id, task);
        self.recount();
    }

    pub fn task(&self, id: TaskId) -> Option<&TaskRecord> {
        self.tasks.get(&id)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut TaskRecord> {
        self.tasks.get_mut(&id)
    }

    /// Recomputes the per-status counters from the task table.
    pub fn recount(&mut self) {
        let mut counts = TaskCounts {
            total: self.tasks.len() as u32,
            ..TaskCounts::default()
        };
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Submitted
                | TaskStatus::Pending
                | TaskStatus::WaitingOnError
                | TaskStatus::WaitingOnFailure => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Finished => counts.finished += 1,
                TaskStatus::Faulty => counts.faulty += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::InError => counts.in_error += 1,
                TaskStatus::Aborted | TaskStatus::Skipped => {}
            }
        }
        self.counts = counts;
        debug_assert!(self.counts.consistent());
    }

    /// Every task reached a terminal outcome.
    pub fn is_finished(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.values().all(|t| t.status.is_terminal())
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            job_id: self.id,
            owner: self.owner.clone(),
            tenant: self.tenant.clone(),
            status: self.status,
            priority: self.priority,
            counts: self.counts,
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            in_error_since: self.in_error_since,
            start_at: self.start_at,
            cumulated_core_time: self.cumulated_core_time,
            children_count: self.children_count,
        }
    }

    /// Marks the first task start. Returns true when this call started the
    /// job.
    pub(crate) fn start(&mut self, now: DateTime<Utc>) -> bool {
        if self.started_at.is_some() {
            return false;
        }
        self.started_at = Some(now);
        if self.status == JobStatus::Pending {
            self.status = JobStatus::Running;
        }
        true
    }

    /// Clean terminal transition once the last task finished.
    pub(crate) fn terminate(&mut self, now: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Finished;
        self.finished_at = Some(now);
        self.in_error_since = None;
    }

    /// Forced terminal transition. Every non-terminal task is aborted,
    /// except the culprit which keeps the status matching the cause.
    /// Returns the tasks that changed.
    pub(crate) fn force_terminate(
        &mut self,
        status: JobStatus,
        culprit: Option<TaskId>,
        now: DateTime<Utc>,
    ) -> Vec<TaskId> {
        debug_assert!(status.is_terminal());
        let mut changed = Vec::new();
        for task in self.tasks.values_mut() {
            if task.status.is_terminal() {
                continue;
            }
            task.status = match culprit {
                Some(id) if task.id == id => match status {
                    JobStatus::Canceled => TaskStatus::Faulty,
                    JobStatus::Failed => TaskStatus::Failed,
                    _ => TaskStatus::Aborted,
                },
                _ => TaskStatus::Aborted,
            };
            task.finished_at = Some(now);
            task.in_error_since = None;
            task.placement = None;
            changed.push(task.id);
        }
        self.status = status;
        self.finished_at = Some(now);
        self.in_error_since = None;
        self.recount();
        changed
    }

    /// Returns false when the job is terminal or already paused.
    pub(crate) fn set_paused(&mut self) -> bool {
        if self.status.is_terminal() || self.status == JobStatus::Paused {
            return false;
        }
        self.status = JobStatus::Paused;
        true
    }

    /// Leaves the paused state for whatever the tasks dictate. Returns the
    /// new status, or None when the job was not paused.
    pub(crate) fn set_resumed(&mut self) -> Option<JobStatus> {
        if self.status != JobStatus::Paused {
            return None;
        }
        self.status = if self.counts.in_error > 0 {
            JobStatus::InError
        } else if self.started_at.is_none() {
            JobStatus::Pending
        } else if self.counts.running > 0 {
            JobStatus::Running
        } else {
            JobStatus::Stalled
        };
        Some(self.status)
    }

    /// Re-derives the in-error status from the counters. Paused jobs are
    /// left alone. Returns the new status when it changed.
    pub(crate) fn refresh_error_status(&mut self, now: DateTime<Utc>) -> Option<JobStatus> {
        if self.status.is_terminal() {
            return None;
        }
        if self.counts.in_error > 0 {
            if self.status == JobStatus::Paused || self.status == JobStatus::InError {
                return None;
            }
            self.status = JobStatus::InError;
            self.in_error_since = Some(now);
            return Some(JobStatus::InError);
        }
        self.in_error_since = None;
        if self.status == JobStatus::InError {
            self.status = JobStatus::Running;
            return Some(JobStatus::Running);
        }
        None
    }

    /// A running job with nothing executing is stalled. Returns true when
    /// the flip happened.
    pub(crate) fn stall_if_idle(&mut self) -> bool {
        if self.status == JobStatus::Running && self.counts.running == 0 && !self.is_finished() {
            self.status = JobStatus::Stalled;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_tasks(n: u32) -> JobRecord {
        let mut job = JobRecord::new("batch", "alice");
        for i in 0..n {
            let id = job.task_id(i);
            job.push_task(TaskRecord::new(id, format!("t{i}")));
        }
        job
    }

    #[test]
    fn new_job_is_pending_normal_priority() {
        let job = job_with_tasks(2);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, JobPriority::Normal);
        assert_eq!(job.counts.total, 2);
        assert_eq!(job.counts.pending, 2);
        assert!(job.counts.consistent());
    }

    #[test]
    fn start_flips_pending_to_running_once() {
        let mut job = job_with_tasks(1);
        let now = Utc::now();
        assert!(job.start(now));
        assert_eq!(job.status, JobStatus::Running);
        assert!(!job.start(now));
    }

    #[test]
    fn force_terminate_marks_culprit_and_aborts_rest() {
        let mut job = job_with_tasks(3);
        let culprit = job.task_id(1);
        job.task_mut(culprit).unwrap().status = TaskStatus::Running;
        let now = Utc::now();
        let changed = job.force_terminate(JobStatus::Canceled, Some(culprit), now);
        assert_eq!(changed.len(), 3);
        assert_eq!(job.status, JobStatus::Canceled);
        assert_eq!(job.task(culprit).unwrap().status, TaskStatus::Faulty);
        assert_eq!(job.task(job.task_id(0)).unwrap().status, TaskStatus::Aborted);
        assert_eq!(job.counts.faulty, 1);
        assert!(job.is_finished());
    }

    #[test]
    fn force_terminate_failed_marks_culprit_failed() {
        let mut job = job_with_tasks(2);
        let culprit = job.task_id(0);
        job.task_mut(culprit).unwrap().status = TaskStatus::Running;
        let changed = job.force_terminate(JobStatus::Failed, Some(culprit), Utc::now());
        assert_eq!(changed.len(), 2);
        assert_eq!(job.task(culprit).unwrap().status, TaskStatus::Failed);
        assert_eq!(job.counts.failed, 1);
    }

    #[test]
    fn resume_picks_status_from_tasks() {
        let mut job = job_with_tasks(2);
        assert!(job.set_paused());
        assert_eq!(job.set_resumed(), Some(JobStatus::Pending));

        job.start(Utc::now());
        let t0 = job.task_id(0);
        job.task_mut(t0).unwrap().status = TaskStatus::Running;
        job.recount();
        assert!(job.set_paused());
        assert_eq!(job.set_resumed(), Some(JobStatus::Running));

        job.task_mut(t0).unwrap().status = TaskStatus::Finished;
        job.recount();
        assert!(job.set_paused());
        assert_eq!(job.set_resumed(), Some(JobStatus::Stalled));

        let t1 = job.task_id(1);
        job.task_mut(t1).unwrap().status = TaskStatus::InError;
        job.recount();
        assert!(job.set_paused());
        assert_eq!(job.set_resumed(), Some(JobStatus::InError));
    }

    #[test]
    fn refresh_error_status_never_touches_paused_jobs() {
        let mut job = job_with_tasks(1);
        job.start(Utc::now());
        assert!(job.set_paused());
        let t0 = job.task_id(0);
        job.task_mut(t0).unwrap().status = TaskStatus::InError;
        job.recount();
        assert_eq!(job.refresh_error_status(Utc::now()), None);
        assert_eq!(job.status, JobStatus::Paused);
    }

    #[test]
    fn refresh_error_status_clears_in_error_when_tasks_recover() {
        let mut job = job_with_tasks(1);
        job.start(Utc::now());
        let t0 = job.task_id(0);
        job.task_mut(t0).unwrap().status = TaskStatus::InError;
        job.recount();
        assert_eq!(job.refresh_error_status(Utc::now()), Some(JobStatus::InError));
        assert!(job.in_error_since.is_some());

        job.task_mut(t0).unwrap().status = TaskStatus::Pending;
        job.recount();
        assert_eq!(job.refresh_error_status(Utc::now()), Some(JobStatus::Running));
        assert!(job.in_error_since.is_none());
    }

    #[test]
    fn stall_only_applies_to_idle_running_jobs() {
        let mut job = job_with_tasks(2);
        job.start(Utc::now());
        let t0 = job.task_id(0);
        job.task_mut(t0).unwrap().status = TaskStatus::Finished;
        job.recount();
        assert!(job.stall_if_idle());
        assert_eq!(job.status, JobStatus::Stalled);
        assert!(!job.stall_if_idle());
    }

    #[test]
    fn terminal_job_statuses_accept_no_transition() {
        for status in [
            JobStatus::Canceled,
            JobStatus::Failed,
            JobStatus::Killed,
            JobStatus::Finished,
        ] {
            assert!(status.is_terminal());
            assert!(!status.can_transition_to(JobStatus::Running));
        }
    }

    #[test]
    fn status_mirror_encoding_round_trips() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Stalled,
            JobStatus::Paused,
            JobStatus::InError,
            JobStatus::Canceled,
            JobStatus::Failed,
            JobStatus::Killed,
            JobStatus::Finished,
        ] {
            assert_eq!(JobStatus::from_u8(status.as_u8()), status);
        }
        for priority in [
            JobPriority::Idle,
            JobPriority::Lowest,
            JobPriority::Low,
            JobPriority::Normal,
            JobPriority::High,
            JobPriority::Highest,
        ] {
            assert_eq!(JobPriority::from_u8(priority.as_u8()), priority);
        }
    }

    #[test]
    fn job_record_serializes() {
        let job = job_with_tasks(1).with_tenant("acme").with_priority(JobPriority::High);
        let value = serde_json::to_value(&job).expect("serializable");
        assert_eq!(value["owner"], "alice");
        assert_eq!(value["priority"], "High");
        assert_eq!(value["counts"]["total"], 1);
    }
}
