//! Decision rules applied when a task attempt fails.
//!
//! Callers decrement the relevant budget first, then ask the policy
//! what to do next. The rules never mutate the task.

use std::time::Duration;

use crate::config::RetryBackoff;
use crate::model::{OnTaskError, TaskRecord};

/// What to do with a task whose execution returned an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorHandling {
    /// Cancel the whole job, with this task as the culprit.
    CancelJob,
    /// Requeue the task and run it again after the delay.
    RetryAfterDelay(Duration),
    /// Park this task in error, keep the rest of the job going.
    PauseTask,
    /// Park this task in error and pause the whole job.
    PauseJob,
    /// No budget and no policy. The task faults permanently.
    Exhausted,
}

/// Picks the handling for a failed execution. `executions_left` must
/// already account for the attempt that just failed. Retries run down
/// first regardless of policy; the error policy only applies once the
/// budget is gone.
pub fn decide_on_error(task: &TaskRecord, backoff: &dyn RetryBackoff) -> ErrorHandling {
    if task.executions_left == 0 && task.on_error == OnTaskError::CancelJob {
        return ErrorHandling::CancelJob;
    }
    if task.executions_left > 0 {
        return ErrorHandling::RetryAfterDelay(restart_delay(task, backoff));
    }
    if task.on_error == OnTaskError::PauseTask {
        return ErrorHandling::PauseTask;
    }
    if task.on_error == OnTaskError::PauseJob {
        return ErrorHandling::PauseJob;
    }
    ErrorHandling::Exhausted
}

/// Delay before the next attempt: the task's own retry delay when set,
/// otherwise the engine backoff over attempts consumed so far.
pub fn restart_delay(task: &TaskRecord, backoff: &dyn RetryBackoff) -> Duration {
    match task.retry_delay {
        Some(delay) => delay,
        None => backoff.delay_for(task.attempts_consumed()),
    }
}

/// What to do with a task whose node died under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFailureHandling {
    /// Put the task back in the queue. The attempt is not charged.
    Requeue,
    /// Node-failure budget exhausted. The whole job fails.
    FailJob,
}

/// Picks the handling after a node failure. `node_failures_left` must
/// already account for the failure being handled.
pub fn decide_on_node_failure(task: &TaskRecord) -> NodeFailureHandling {
    if task.node_failures_left > 0 {
        NodeFailureHandling::Requeue
    } else {
        NodeFailureHandling::FailJob
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SteppedBackoff;
    use crate::model::{JobId, TaskId};

    fn task_with(on_error: OnTaskError, max_executions: u32, left: u32) -> TaskRecord {
        let id = TaskId {
            job: JobId::new(),
            index: 0,
        };
        let mut task = TaskRecord::new(id, "t")
            .with_max_executions(max_executions)
            .with_on_error(on_error);
        task.executions_left = left;
        task
    }

    #[test]
    fn cancelling_policy_beats_exhaustion() {
        let task = task_with(OnTaskError::CancelJob, 2, 0);
        let backoff = SteppedBackoff::default();
        assert_eq!(decide_on_error(&task, &backoff), ErrorHandling::CancelJob);
    }

    #[test]
    fn remaining_budget_retries_even_under_cancelling_policy() {
        let task = task_with(OnTaskError::CancelJob, 3, 1);
        let backoff = SteppedBackoff::default();
        assert!(matches!(
            decide_on_error(&task, &backoff),
            ErrorHandling::RetryAfterDelay(_)
        ));
    }

    #[test]
    fn retry_delay_prefers_task_override() {
        let mut task = task_with(OnTaskError::Continue, 3, 1);
        task.retry_delay = Some(Duration::from_secs(42));
        let backoff = SteppedBackoff::default();
        assert_eq!(
            decide_on_error(&task, &backoff),
            ErrorHandling::RetryAfterDelay(Duration::from_secs(42))
        );
    }

    #[test]
    fn retry_delay_follows_backoff_per_attempt() {
        let backoff = SteppedBackoff::default();
        // Two of three attempts consumed: third retry waits 1 + 2*1.
        let task = task_with(OnTaskError::Continue, 3, 1);
        assert_eq!(
            decide_on_error(&task, &backoff),
            ErrorHandling::RetryAfterDelay(Duration::from_secs(3))
        );
    }

    #[test]
    fn pause_policies_apply_once_exhausted() {
        let backoff = SteppedBackoff::default();
        let task = task_with(OnTaskError::PauseTask, 1, 0);
        assert_eq!(decide_on_error(&task, &backoff), ErrorHandling::PauseTask);

        let task = task_with(OnTaskError::PauseJob, 1, 0);
        assert_eq!(decide_on_error(&task, &backoff), ErrorHandling::PauseJob);
    }

    #[test]
    fn continue_policy_exhausts_quietly() {
        let task = task_with(OnTaskError::Continue, 1, 0);
        let backoff = SteppedBackoff::default();
        assert_eq!(decide_on_error(&task, &backoff), ErrorHandling::Exhausted);
    }

    #[test]
    fn node_failures_requeue_until_budget_runs_out() {
        let mut task = task_with(OnTaskError::Continue, 1, 1);
        task.node_failures_left = 1;
        assert_eq!(decide_on_node_failure(&task), NodeFailureHandling::Requeue);

        task.node_failures_left = 0;
        assert_eq!(decide_on_node_failure(&task), NodeFailureHandling::FailJob);
    }
}
