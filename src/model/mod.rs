//! Plain data model shared across the crate.

pub mod job;
pub mod task;

pub use job::{
    Credentials, ExternalEndpoint, JobId, JobInfo, JobPriority, JobRecord, JobStatus, TaskCounts,
    GENERIC_INFO_START_AT,
};
pub use task::{
    LauncherRef, OnTaskError, RestartMode, TaskId, TaskInfo, TaskOutcome, TaskRecord, TaskStatus,
};
