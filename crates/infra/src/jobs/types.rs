//! Jobs, their lifecycle, failure classification and retry policy.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Job kind, used to route to a handler and to enforce single-flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Trigger a reference-data refresh of one subject.
    Refresh { subject: String },
    Custom { kind: String },
}

impl JobKind {
    pub fn refresh(subject: impl Into<String>) -> Self {
        Self::Refresh {
            subject: subject.into(),
        }
    }

    pub fn custom(kind: impl Into<String>) -> Self {
        Self::Custom { kind: kind.into() }
    }

    /// Handler lookup key, e.g. `refresh.securities`.
    pub fn type_name(&self) -> String {
        match self {
            JobKind::Refresh { subject } => format!("refresh.{subject}"),
            JobKind::Custom { kind } => kind.clone(),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.type_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Enqueued, or waiting out a retry delay.
    Pending,
    Running,
    Completed,
    /// Last attempt failed; claimable again once `scheduled_at` passes.
    Failed {
        error: String,
        attempt: u32,
    },
    /// Retries exhausted or suppressed
    DeadLettered {
        error: String,
        attempts: u32,
    },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLettered { .. })
    }

    /// Scheduled or executing; blocks another job of the same kind.
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }
}

/// Classification of a job failure, used by [`RetrySuppression`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network blips, timeouts, unavailable backends.
    Transient,
    /// Bad or drifting data.
    Data,
    /// A collaborator the job needs is not wired or not declared.
    MissingDependency,
    /// No handler could be resolved for the job.
    TypeLoad,
    Other,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Data => "data",
            FailureKind::MissingDependency => "missing_dependency",
            FailureKind::TypeLoad => "type_load",
            FailureKind::Other => "other",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Failure kinds that must never be retried.
///
/// A matching failure exhausts the job's attempts so it dead-letters on the
/// spot instead of cycling through the backoff schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySuppression {
    do_not_retry: HashSet<FailureKind>,
}

impl Default for RetrySuppression {
    fn default() -> Self {
        Self::of([FailureKind::MissingDependency, FailureKind::TypeLoad])
    }
}

impl RetrySuppression {
    pub fn of(kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        Self {
            do_not_retry: kinds.into_iter().collect(),
        }
    }

    /// Retry everything the policy allows.
    pub fn none() -> Self {
        Self::of([])
    }

    pub fn with(mut self, kind: FailureKind) -> Self {
        self.do_not_retry.insert(kind);
        self
    }

    pub fn suppresses(&self, kind: FailureKind) -> bool {
        self.do_not_retry.contains(&kind)
    }
}

/// Delay curve between attempts, indexed by the attempt that just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "curve", rename_all = "snake_case")]
pub enum Backoff {
    Constant { every: Duration },
    /// `base * attempt`, capped.
    Linear { base: Duration, cap: Duration },
    /// `base * 2^(attempt - 1)`, capped.
    Doubling { base: Duration, cap: Duration },
}

impl Backoff {
    /// Longest delay this curve can produce before jitter.
    pub fn cap(&self) -> Duration {
        match *self {
            Backoff::Constant { every } => every,
            Backoff::Linear { cap, .. } | Backoff::Doubling { cap, .. } => cap,
        }
    }

    fn raw(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Constant { every } => every,
            Backoff::Linear { base, cap } => base.saturating_mul(attempt).min(cap),
            Backoff::Doubling { base, cap } => {
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(cap)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts including the first one (1 = no retries).
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Fraction of the delay spread either side, clamped to `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5, Duration::from_secs(1), Duration::from_secs(300))
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Constant { every: delay },
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Doubling { base, cap },
            jitter: 0.1,
        }
    }

    /// `max_retry_count` retries after the first attempt, doubling from
    /// `base` up to 64 times `base`.
    pub fn from_max_retry_count(max_retry_count: u32, base: Duration) -> Self {
        Self::exponential(
            max_retry_count.saturating_add(1),
            base,
            base.saturating_mul(64),
        )
    }

    pub fn with_linear_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff = Backoff::Linear { base, cap };
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Wait after `attempt` (1-indexed) failed. Never above the curve's cap.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let raw = self.backoff.raw(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return raw;
        }

        // Spread is a function of the attempt so that tests stay deterministic.
        let spread = f64::from(attempt.wrapping_mul(17) % 100) / 50.0 - 1.0;
        let factor = (1.0 + jitter * spread).max(0.0);
        raw.mul_f64(factor).min(self.backoff.cap())
    }

    /// Whether another attempt may follow `attempt` (1-indexed).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub failure: Option<JobFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub retry_policy: RetryPolicy,
    /// Attempts started so far.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Not claimable before this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub history: Vec<JobAttemptRecord>,
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Job {
    pub fn new(kind: JobKind, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            kind,
            payload,
            status: JobStatus::Pending,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            history: Vec::new(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| now >= at)
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.attempt += 1;
        self.transition(JobStatus::Running, now);
    }

    pub fn mark_completed(&mut self, started_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.record_attempt(started_at, now, None);
        self.transition(JobStatus::Completed, now);
    }

    /// Record a failed attempt, then either schedule the retry the policy
    /// allows or dead-letter the job.
    pub fn mark_failed(
        &mut self,
        failure: JobFailure,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let error = failure.to_string();
        self.record_attempt(started_at, now, Some(failure));

        let status = if self.retry_policy.should_retry(self.attempt) {
            let wait = self.retry_policy.delay_for_attempt(self.attempt);
            self.scheduled_at = Some(after(now, wait));
            JobStatus::Failed {
                error,
                attempt: self.attempt,
            }
        } else {
            JobStatus::DeadLettered {
                error,
                attempts: self.attempt,
            }
        };
        self.transition(status, now);
    }

    /// Force the attempt counter to the policy maximum; the next failure
    /// dead-letters.
    pub fn exhaust_retries(&mut self) {
        self.attempt = self.attempt.max(self.retry_policy.max_attempts);
    }

    /// Reschedule without consuming an attempt.
    pub fn defer(&mut self, delay: Duration, now: DateTime<Utc>) {
        self.attempt = self.attempt.saturating_sub(1);
        self.scheduled_at = Some(after(now, delay));
        self.transition(JobStatus::Pending, now);
    }

    fn transition(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }

    fn record_attempt(
        &mut self,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        failure: Option<JobFailure>,
    ) {
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at,
            failure,
        });
    }
}

/// What a handler reports back for one attempt.
#[derive(Debug, Clone)]
pub enum JobResult {
    Success,
    Failure(JobFailure),
    /// Not a failure: run again after the delay without consuming an attempt.
    RetryAfter(Duration),
}

/// A job that stopped for good, kept for inspection and manual replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            job,
            reason: reason.into(),
            dead_lettered_at: at,
        }
    }
}
