//! Recurring job schedules.
//!
//! A [`Scheduler`] turns schedules into jobs in the store. At most one job per
//! kind is in flight: an occurrence that comes due while the previous job of
//! the same kind is still pending or running is skipped.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use refsync_core::SharedClock;

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobId, JobKind, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("schedule interval must be greater than zero")]
    ZeroInterval,
}

#[derive(Debug, Clone)]
pub enum Cadence {
    /// Fixed delay between occurrences.
    Interval(Duration),
    Cron(Box<cron::Schedule>),
}

impl Cadence {
    pub fn interval(every: Duration) -> Result<Self, ScheduleError> {
        if every.is_zero() {
            return Err(ScheduleError::ZeroInterval);
        }
        Ok(Self::Interval(every))
    }

    /// Parse a cron expression with a leading seconds field
    /// (`0 0 3 * * *` = every day at 03:00 UTC).
    pub fn cron(expression: &str) -> Result<Self, ScheduleError> {
        let schedule =
            cron::Schedule::from_str(expression).map_err(|e| ScheduleError::InvalidCron {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::Cron(Box::new(schedule)))
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Interval(every) => chrono::Duration::from_std(*every)
                .ok()
                .and_then(|d| after.checked_add_signed(d)),
            Cadence::Cron(schedule) => schedule.after(&after).next(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobSchedule {
    pub kind: JobKind,
    pub cadence: Cadence,
    /// Fire once as soon as the scheduler starts.
    pub run_on_startup: bool,
    pub payload: serde_json::Value,
    pub retry_policy: RetryPolicy,
}

impl JobSchedule {
    pub fn new(kind: JobKind, cadence: Cadence) -> Self {
        Self {
            kind,
            cadence,
            run_on_startup: false,
            payload: serde_json::Value::Null,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn run_on_startup(mut self, enabled: bool) -> Self {
        self.run_on_startup = enabled;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

#[derive(Debug)]
struct Slot {
    schedule: JobSchedule,
    next_due: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    clock: SharedClock,
    slots: Vec<Slot>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            slots: Vec::new(),
        }
    }

    pub fn add(&mut self, schedule: JobSchedule) {
        let now = self.clock.now();
        let next_due = if schedule.run_on_startup {
            Some(now)
        } else {
            schedule.cadence.next_after(now)
        };
        info!(kind = %schedule.kind, next_due = ?next_due, "job scheduled");
        self.slots.push(Slot { schedule, next_due });
    }

    /// Earliest upcoming occurrence across all schedules.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.slots.iter().filter_map(|s| s.next_due).min()
    }

    /// Enqueue a job for every schedule that is due; returns the new job ids.
    pub fn tick(&mut self) -> Result<Vec<JobId>, JobStoreError> {
        let now = self.clock.now();
        let mut enqueued = Vec::new();

        for slot in &mut self.slots {
            let Some(due) = slot.next_due else { continue };
            if due > now {
                continue;
            }
            slot.next_due = slot.schedule.cadence.next_after(now);

            let kind = &slot.schedule.kind;
            if let Some(running) = self.store.in_flight(kind)? {
                debug!(%kind, job_id = %running.id, "previous job still in flight, skipping occurrence");
                continue;
            }

            let job = Job::new(kind.clone(), slot.schedule.payload.clone(), now)
                .with_retry_policy(slot.schedule.retry_policy.clone());
            let id = self.store.enqueue(job)?;
            debug!(%kind, job_id = %id, "job enqueued");
            enqueued.push(id);
        }

        Ok(enqueued)
    }

    /// Tick until `cancel` fires, sleeping until the next occurrence (at most
    /// `poll_interval`).
    pub fn spawn(mut self, poll_interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(schedules = self.slots.len(), "job scheduler started");
            loop {
                if let Err(e) = self.tick() {
                    error!(error = %e, "scheduler tick failed");
                }

                let wait = self
                    .next_due()
                    .and_then(|due| (due - self.clock.now()).to_std().ok())
                    .map_or(poll_interval, |until| until.min(poll_interval));

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            info!("job scheduler stopped");
        })
    }
}

impl core::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler")
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}
