//! Engine configuration and retry backoff policy.

use std::time::Duration;

use crate::model::JobId;

/// Computes the delay before a faulted task is eligible to run again.
///
/// `attempt` is the number of executions already consumed, so the first
/// failure calls `delay_for(1)`. Implementations must be non-decreasing
/// in `attempt`.
pub trait RetryBackoff: Send + Sync {
    fn delay_for(&self, attempt: u32) -> Duration;
}

/// Linear backoff with a hard ceiling.
///
/// The first retry waits `initial`, each subsequent retry adds
/// `increment`, and the delay never exceeds `max`.
#[derive(Debug, Clone)]
pub struct SteppedBackoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Added to the delay for every further retry.
    pub increment: Duration,
    /// Upper bound on the computed delay.
    pub max: Duration,
}

impl Default for SteppedBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            increment: Duration::from_secs(2),
            max: Duration::from_secs(120),
        }
    }
}

impl SteppedBackoff {
    pub fn new(initial: Duration, increment: Duration, max: Duration) -> Self {
        Self {
            initial,
            increment,
            max,
        }
    }
}

impl RetryBackoff for SteppedBackoff {
    fn delay_for(&self, attempt: u32) -> Duration {
        let steps = attempt.saturating_sub(1);
        let delay = self
            .initial
            .saturating_add(self.increment.saturating_mul(steps));
        delay.min(self.max)
    }
}

/// Tunables for the lifecycle engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Whether a killed job is reported as errored to termination
    /// listeners. Defaults to false: an operator kill is not a failure.
    pub kill_counts_as_errors: bool,
    /// Prefix for per-job signal channel names. The job id is appended
    /// to form the channel cleaned up when the job terminates.
    pub signal_channel_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kill_counts_as_errors: false,
            signal_channel_prefix: "job-signals-".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn with_kill_counts_as_errors(mut self, value: bool) -> Self {
        self.kill_counts_as_errors = value;
        self
    }

    pub fn with_signal_channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.signal_channel_prefix = prefix.into();
        self
    }

    /// Signal channel name for a job.
    pub fn signal_channel(&self, job_id: JobId) -> String {
        format!("{}{}", self.signal_channel_prefix, job_id)
    }
}
