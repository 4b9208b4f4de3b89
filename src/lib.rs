//! Concurrent job and task lifecycle core for a distributed workload
//! scheduler.
//!
//! The crate owns the live set of jobs: their records, their per-job
//! locks, the index of running executions and every state transition
//! between submission and termination. Persistence, event delivery and
//! signal channels stay behind traits so the surrounding services can
//! plug in their own.

pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod policy;
pub mod registry;
pub mod running;
pub mod termination;
pub mod traits;

pub use config::{EngineConfig, RetryBackoff, SteppedBackoff};
pub use engine::{LifecycleEngine, SchedulingBatch};
pub use error::{Result, SchedulerError};
pub use model::{
    Credentials, ExternalEndpoint, JobId, JobInfo, JobPriority, JobRecord, JobStatus, LauncherRef,
    OnTaskError, RestartMode, TaskCounts, TaskId, TaskInfo, TaskOutcome, TaskRecord, TaskStatus,
    GENERIC_INFO_START_AT,
};
pub use policy::{ErrorHandling, NodeFailureHandling};
pub use registry::{JobGuard, JobRegistry, TryLockJob};
pub use running::{RunningTask, RunningTaskIndex};
pub use termination::{
    DelayedRestart, ReleaseCause, ReleasedTask, TerminatedJob, TerminationBatch,
};
pub use traits::{
    NoSignals, NotifyError, Notifier, PersistenceError, PersistenceGateway, SchedulerEvent,
    SignalChannelStore, SignalError,
};
