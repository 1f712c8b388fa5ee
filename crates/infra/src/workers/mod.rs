//! Refresh pipeline workers.
//!
//! - `RefreshTrigger`: scheduled job that opens a run and publishes `Refresh`
//! - `RefreshWorker`: consumes `Refresh` and drives the run to completion
//! - `NotificationWorker`: turns outcome events into one-line summaries

mod notification_worker;
mod refresh_trigger;
mod refresh_worker;

pub use notification_worker::{NotificationWorker, Notifier, NotifyError, TracingNotifier, render};
pub use refresh_trigger::RefreshTrigger;
pub use refresh_worker::{PipelineError, RefreshWorker, RefreshWorkerConfig};
