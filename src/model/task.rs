//! Task-level data model: identity, status machine, execution bookkeeping.
//!
//! A task always belongs to exactly one job and is only mutated while the
//! owning job's lock is held. Everything here is plain data; the engine
//! drives the transitions.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::JobId;

/// Identity of a task, scoped to its owning job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub job: JobId,
    pub index: u32,
}

impl TaskId {
    pub fn new(job: JobId, index: u32) -> Self {
        Self { job, index }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.job, self.index)
    }
}

/// Lifecycle states of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Accepted as part of its job, not yet eligible for dispatch.
    Submitted,
    /// Eligible for the next scheduling pass.
    Pending,
    /// Has a live execution on some node.
    Running,
    /// Completed without error.
    Finished,
    /// Exhausted its executions with an application error.
    Faulty,
    /// Exhausted its node-failure budget.
    Failed,
    /// Suspended after an error, waiting for an operator decision.
    InError,
    /// Terminated by a kill or by a job-level termination.
    Aborted,
    /// Will never run.
    Skipped,
    /// Errored, waiting out its restart delay.
    WaitingOnError,
    /// Lost its node, waiting to be rescheduled.
    WaitingOnFailure,
}

impl TaskStatus {
    /// Terminal outcomes. A job finishes once every task reaches one.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Finished
                | TaskStatus::Faulty
                | TaskStatus::Failed
                | TaskStatus::Aborted
                | TaskStatus::Skipped
        )
    }

    pub fn is_alive(self) -> bool {
        !self.is_terminal()
    }

    /// States the scheduling pass may start an execution from.
    pub fn is_schedulable(self) -> bool {
        matches!(self, TaskStatus::Submitted | TaskStatus::Pending)
    }

    /// Parked until a restart delay elapses.
    pub fn is_waiting(self) -> bool {
        matches!(self, TaskStatus::WaitingOnError | TaskStatus::WaitingOnFailure)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            Submitted => matches!(next, Pending | Aborted | Skipped),
            Pending => matches!(next, Running | Aborted | Skipped),
            Running => matches!(
                next,
                Finished | Faulty | Failed | InError | Aborted | WaitingOnError | WaitingOnFailure
            ),
            WaitingOnError | WaitingOnFailure => matches!(next, Pending | Running | Aborted),
            InError => matches!(next, Pending | Running | Finished | Aborted),
            Finished | Faulty | Failed | Aborted | Skipped => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Submitted => "submitted",
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Finished => "finished",
            TaskStatus::Faulty => "faulty",
            TaskStatus::Failed => "failed",
            TaskStatus::InError => "in-error",
            TaskStatus::Aborted => "aborted",
            TaskStatus::Skipped => "skipped",
            TaskStatus::WaitingOnError => "waiting-on-error",
            TaskStatus::WaitingOnFailure => "waiting-on-failure",
        };
        f.write_str(s)
    }
}

/// Where a task may run again after an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartMode {
    /// Any node is acceptable.
    #[default]
    Anywhere,
    /// Exclude every node the failed execution ran on.
    Elsewhere,
}

/// Configured reaction once an execution ends in error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnTaskError {
    /// Let the rest of the job proceed.
    #[default]
    Continue,
    /// Suspend this task once its executions are exhausted.
    PauseTask,
    /// Suspend this task and pause the whole job.
    PauseJob,
    /// Cancel the whole job once executions are exhausted.
    CancelJob,
}

/// Where an execution runs and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LauncherRef {
    /// Control endpoint of the launcher driving the execution.
    pub endpoint: String,
    /// Nodes the execution occupies.
    pub node_ids: Vec<u64>,
}

impl LauncherRef {
    pub fn new(endpoint: impl Into<String>, node_ids: Vec<u64>) -> Self {
        Self {
            endpoint: endpoint.into(),
            node_ids,
        }
    }
}

/// Result reported when an execution ends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Serialized task value, when the execution produced one.
    pub value: Option<String>,
    /// Error description when the execution failed.
    pub error: Option<String>,
    /// Key/value results merged into the job result map on success.
    pub result_map: HashMap<String, String>,
}

impl TaskOutcome {
    pub fn success(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn had_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Mutable per-task state, owned by the job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    /// Total executions allowed, at least 1.
    pub max_executions: u32,
    /// Executions not yet consumed by an error.
    pub executions_left: u32,
    /// Reschedules left after node losses.
    pub node_failures_left: u32,
    /// Sequence number of the latest execution, 0 before the first.
    /// Every dispatch gets a fresh number, including restarts that
    /// charge no execution.
    pub attempt: u32,
    /// Fixed restart delay. When unset the engine back-off applies.
    pub retry_delay: Option<Duration>,
    pub restart_mode: RestartMode,
    pub on_error: OnTaskError,
    /// The result is kept with the job after termination.
    pub precious: bool,
    /// 0..=100.
    pub progress: u8,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub in_error_since: Option<DateTime<Utc>>,
    /// Placement of the current or last execution.
    pub placement: Option<LauncherRef>,
    /// Nodes the next execution must avoid.
    pub excluded_nodes: HashSet<u64>,
    /// Parent tasks whose results this task still references.
    pub parent_results: Vec<TaskId>,
    pub result: Option<TaskOutcome>,
}

impl TaskRecord {
    pub fn new(id: TaskId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: TaskStatus::Submitted,
            max_executions: 1,
            executions_left: 1,
            node_failures_left: 2,
            attempt: 0,
            retry_delay: None,
            restart_mode: RestartMode::default(),
            on_error: OnTaskError::default(),
            precious: false,
            progress: 0,
            scheduled_at: None,
            started_at: None,
            finished_at: None,
            in_error_since: None,
            placement: None,
            excluded_nodes: HashSet::new(),
            parent_results: Vec::new(),
            result: None,
        }
    }

    pub fn with_max_executions(mut self, max: u32) -> Self {
        let max = max.max(1);
        self.max_executions = max;
        self.executions_left = max;
        self
    }

    pub fn with_node_failure_budget(mut self, budget: u32) -> Self {
        self.node_failures_left = budget;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn with_restart_mode(mut self, mode: RestartMode) -> Self {
        self.restart_mode = mode;
        self
    }

    pub fn with_on_error(mut self, on_error: OnTaskError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_precious(mut self) -> Self {
        self.precious = true;
        self
    }

    pub fn with_parent_results(mut self, parents: Vec<TaskId>) -> Self {
        self.parent_results = parents;
        self
    }

    /// Executions already consumed by errors.
    pub fn attempts_consumed(&self) -> u32 {
        self.max_executions.saturating_sub(self.executions_left)
    }

    /// Sequence number of the live or latest execution, starting at 1
    /// from the first dispatch.
    pub fn current_attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn begin_execution(&mut self, launcher: LauncherRef, now: DateTime<Utc>) {
        self.attempt += 1;
        self.status = TaskStatus::Running;
        self.started_at = Some(now);
        self.progress = 0;
        self.placement = Some(launcher);
    }

    /// Read-only snapshot handed to event consumers.
    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            task_id: self.id,
            name: self.name.clone(),
            status: self.status,
            progress: self.progress,
            executions_left: self.executions_left,
            node_failures_left: self.node_failures_left,
            started_at: self.started_at,
            finished_at: self.finished_at,
            in_error_since: self.in_error_since,
        }
    }
}

/// Read-only task snapshot published with task events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub executions_left: u32,
    pub node_failures_left: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub in_error_since: Option<DateTime<Utc>>,
}
