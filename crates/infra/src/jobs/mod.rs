//! Scheduled work: the refresh trigger and anything else run on a timer.
//!
//! ## Design
//!
//! - Jobs are typed by kind and run by registered handlers
//! - Retry policy with capped exponential backoff
//! - Failures are classified; kinds in the suppression set skip straight to
//!   the dead-letter queue
//! - Recurring schedules (interval or cron) enqueue jobs, single-flight per
//!   kind
//!
//! ## Components
//!
//! - `Job`: job record with payload, status and attempt history
//! - `JobStore`: persistence (in-memory)
//! - `JobExecutor`: claims jobs, runs their handler, applies the retry policy
//! - `Scheduler`: turns `JobSchedule`s into jobs

pub mod executor;
pub mod schedule;
pub mod store;
pub mod types;

pub use executor::{
    ExecutionOutcome, ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle,
    JobHandler,
};
pub use schedule::{Cadence, JobSchedule, ScheduleError, Scheduler};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    Backoff, DeadLetterEntry, FailureKind, Job, JobFailure, JobId, JobKind, JobResult, JobStatus,
    RetryPolicy, RetrySuppression,
};
