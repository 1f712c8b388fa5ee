//! Job executor with retry, backoff and retry suppression.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use refsync_core::SharedClock;

use super::store::{JobStore, JobStoreError};
use super::types::{FailureKind, Job, JobFailure, JobKind, JobResult, JobStatus, RetrySuppression};

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, job: &Job) -> JobResult;
}

#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often to poll for new jobs
    pub poll_interval: Duration,
    pub max_concurrent: usize,
    /// Name for logging
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            max_concurrent: 4,
            name: "job-executor".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// What happened to a job after one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    RetryScheduled { at: DateTime<Utc> },
    /// Handler asked to run again later; no attempt consumed.
    Deferred { until: DateTime<Utc> },
    DeadLettered { reason: String, suppressed: bool },
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub retries_suppressed: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl ExecutorStats {
    fn record(&mut self, outcome: &Result<ExecutionOutcome, JobStoreError>) {
        self.jobs_processed += 1;
        match outcome {
            Ok(ExecutionOutcome::Succeeded) => self.jobs_succeeded += 1,
            Ok(ExecutionOutcome::Deferred { .. }) => {}
            Ok(ExecutionOutcome::RetryScheduled { .. }) | Err(_) => self.jobs_failed += 1,
            Ok(ExecutionOutcome::DeadLettered { suppressed, .. }) => {
                self.jobs_failed += 1;
                self.jobs_dead_lettered += 1;
                if *suppressed {
                    self.retries_suppressed += 1;
                }
            }
        }
    }
}

fn lock_stats(stats: &Mutex<ExecutorStats>) -> std::sync::MutexGuard<'_, ExecutorStats> {
    stats.lock().unwrap_or_else(|p| p.into_inner())
}

/// Handle to a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    cancel: CancellationToken,
    tasks: TaskTracker,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Stop claiming jobs and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    pub fn stats(&self) -> ExecutorStats {
        lock_stats(&self.stats).clone()
    }
}

/// Background job executor.
///
/// Polls a job store for ready jobs, runs them with registered handlers, and
/// applies the job's retry policy. Failures whose kind is in the
/// [`RetrySuppression`] set are dead-lettered on their first occurrence.
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    suppression: RetrySuppression,
    clock: SharedClock,
}

impl JobExecutor {
    pub fn new(store: Arc<dyn JobStore>, clock: SharedClock) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            suppression: RetrySuppression::default(),
            clock,
        }
    }

    pub fn with_suppression(mut self, suppression: RetrySuppression) -> Self {
        self.suppression = suppression;
        self
    }

    /// Register a handler for a job kind.
    ///
    /// Patterns: exact type name (`refresh.securities`), category
    /// (`refresh.*`) or wildcard (`*`).
    pub fn register_handler(&mut self, pattern: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(pattern.into(), handler);
    }

    fn get_handler(&self, kind: &JobKind) -> Option<Arc<dyn JobHandler>> {
        let type_name = kind.type_name();
        if let Some(h) = self.handlers.get(&type_name) {
            return Some(h.clone());
        }

        self.handlers
            .iter()
            .find(|(pattern, _)| {
                pattern
                    .strip_suffix(".*")
                    .is_some_and(|prefix| type_name.starts_with(&format!("{prefix}.")))
            })
            .map(|(_, h)| h.clone())
            .or_else(|| self.handlers.get("*").cloned())
    }

    /// Run one attempt of a claimed job and persist the result.
    pub async fn execute_one(&self, job: &mut Job) -> Result<ExecutionOutcome, JobStoreError> {
        let started = self.clock.now();

        let result = match self.get_handler(&job.kind) {
            Some(handler) => handler.run(job).await,
            None => JobResult::Failure(JobFailure::new(
                FailureKind::TypeLoad,
                format!("no handler for job kind: {}", job.kind),
            )),
        };

        match result {
            JobResult::Success => {
                job.mark_completed(started, self.clock.now());
                self.store.update(job)?;
                debug!(job_id = %job.id, kind = %job.kind, "job completed");
                Ok(ExecutionOutcome::Succeeded)
            }
            JobResult::Failure(failure) => self.fail(job, failure, started),
            JobResult::RetryAfter(delay) => {
                let now = self.clock.now();
                job.defer(delay, now);
                self.store.update(job)?;
                let until = job.scheduled_at.unwrap_or(now);
                debug!(job_id = %job.id, %until, "job deferred");
                Ok(ExecutionOutcome::Deferred { until })
            }
        }
    }

    fn fail(
        &self,
        job: &mut Job,
        failure: JobFailure,
        started: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, JobStoreError> {
        let suppressed = self.suppression.suppresses(failure.kind);
        if suppressed {
            warn!(
                job_id = %job.id,
                kind = %job.kind,
                failure_kind = %failure.kind,
                "retries suppressed for non-retryable failure"
            );
            job.exhaust_retries();
        }

        let now = self.clock.now();
        job.mark_failed(failure, started, now);
        self.store.update(job)?;

        match &job.status {
            JobStatus::DeadLettered { error, attempts } => {
                warn!(job_id = %job.id, kind = %job.kind, attempts, %error, "job dead-lettered");
                let reason = error.clone();
                self.store.dead_letter(job.clone(), reason.clone(), now)?;
                Ok(ExecutionOutcome::DeadLettered { reason, suppressed })
            }
            _ => {
                let at = job.scheduled_at.unwrap_or(now);
                debug!(job_id = %job.id, attempt = job.attempt, %at, "job retry scheduled");
                Ok(ExecutionOutcome::RetryScheduled { at })
            }
        }
    }

    /// Spawn the executor loop on the current tokio runtime.
    pub fn spawn(self, config: JobExecutorConfig) -> JobExecutorHandle {
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));

        tasks.spawn(executor_loop(
            Arc::new(self),
            config,
            cancel.clone(),
            tasks.clone(),
            stats.clone(),
        ));

        JobExecutorHandle {
            cancel,
            tasks,
            stats,
        }
    }
}

async fn executor_loop(
    executor: Arc<JobExecutor>,
    config: JobExecutorConfig,
    cancel: CancellationToken,
    tasks: TaskTracker,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    info!(executor = %config.name, "job executor started");
    let start_time = Instant::now();
    let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));

    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        lock_stats(&stats).uptime_secs = start_time.elapsed().as_secs();

        match executor.store.claim_next(executor.clock.now()) {
            Ok(Some(mut job)) => {
                debug!(executor = %config.name, job_id = %job.id, kind = %job.kind, "claimed job");
                lock_stats(&stats).current_running += 1;

                let executor = executor.clone();
                let stats = stats.clone();
                tasks.spawn(async move {
                    let outcome = executor.execute_one(&mut job).await;
                    if let Err(e) = &outcome {
                        error!(job_id = %job.id, error = %e, "failed to persist job result");
                    }
                    let mut s = lock_stats(&stats);
                    s.current_running = s.current_running.saturating_sub(1);
                    s.record(&outcome);
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
            Err(e) => {
                drop(permit);
                error!(executor = %config.name, error = %e, "failed to claim job");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
        }
    }

    info!(executor = %config.name, "job executor stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::RetryPolicy;
    use refsync_core::{Clock, ManualClock, SystemClock};

    struct Fails {
        kind: FailureKind,
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for Fails {
        async fn run(&self, _job: &Job) -> JobResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            JobResult::Failure(JobFailure::new(self.kind, "boom"))
        }
    }

    struct Succeeds;

    #[async_trait]
    impl JobHandler for Succeeds {
        async fn run(&self, _job: &Job) -> JobResult {
            JobResult::Success
        }
    }

    fn fails(kind: FailureKind) -> Arc<Fails> {
        Arc::new(Fails {
            kind,
            calls: AtomicU32::new(0),
        })
    }

    fn enqueue(store: &InMemoryJobStore, kind: JobKind, max_retry_count: u32) -> Job {
        let job = Job::new(kind, serde_json::json!({}), Utc::now()).with_retry_policy(
            RetryPolicy::from_max_retry_count(max_retry_count, Duration::from_secs(1)),
        );
        store.enqueue(job.clone()).unwrap();
        job
    }

    #[tokio::test]
    async fn suppressed_failure_is_not_retried_despite_retry_budget() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::starting_now();
        let mut executor = JobExecutor::new(store.clone(), clock.clone());
        executor.register_handler("refresh.securities", fails(FailureKind::MissingDependency));

        let job = enqueue(&store, JobKind::refresh("securities"), 10);
        let mut claimed = store.claim_next(clock.now()).unwrap().unwrap();
        let outcome = executor.execute_one(&mut claimed).await.unwrap();

        assert!(matches!(
            outcome,
            ExecutionOutcome::DeadLettered {
                suppressed: true,
                ..
            }
        ));
        assert_eq!(claimed.attempt, claimed.retry_policy.max_attempts);

        clock.advance(Duration::from_secs(3600));
        assert!(store.claim_next(clock.now()).unwrap().is_none());
        assert_eq!(store.list_dead_letters(10).unwrap()[0].job.id, job.id);
    }

    #[tokio::test]
    async fn transient_failure_retries_up_to_max_retry_count() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::starting_now();
        let handler = fails(FailureKind::Transient);
        let mut executor = JobExecutor::new(store.clone(), clock.clone());
        executor.register_handler("refresh.*", handler.clone());

        enqueue(&store, JobKind::refresh("securities"), 2);

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            clock.advance(Duration::from_secs(3600));
            let mut claimed = store.claim_next(clock.now()).unwrap().unwrap();
            outcomes.push(executor.execute_one(&mut claimed).await.unwrap());
        }

        assert!(matches!(outcomes[0], ExecutionOutcome::RetryScheduled { .. }));
        assert!(matches!(outcomes[1], ExecutionOutcome::RetryScheduled { .. }));
        assert!(matches!(
            outcomes[2],
            ExecutionOutcome::DeadLettered {
                suppressed: false,
                ..
            }
        ));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn missing_handler_is_a_type_load_failure_and_suppressed() {
        let store = InMemoryJobStore::arc();
        let executor = JobExecutor::new(store.clone(), SystemClock::shared());

        enqueue(&store, JobKind::custom("unregistered"), 5);
        let mut claimed = store.claim_next(Utc::now()).unwrap().unwrap();
        let outcome = executor.execute_one(&mut claimed).await.unwrap();

        match outcome {
            ExecutionOutcome::DeadLettered { reason, suppressed } => {
                assert!(suppressed);
                assert!(reason.contains("type_load"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_suppression_set_retries_everything() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone(), SystemClock::shared())
            .with_suppression(RetrySuppression::none());
        executor.register_handler("*", fails(FailureKind::TypeLoad));

        enqueue(&store, JobKind::custom("anything"), 3);
        let mut claimed = store.claim_next(Utc::now()).unwrap().unwrap();
        let outcome = executor.execute_one(&mut claimed).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::RetryScheduled { .. }));
    }

    #[tokio::test]
    async fn category_pattern_requires_a_word_boundary() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone(), SystemClock::shared());
        executor.register_handler("refresh.*", Arc::new(Succeeds));

        enqueue(&store, JobKind::custom("refresher"), 0);
        let mut claimed = store.claim_next(Utc::now()).unwrap().unwrap();
        let outcome = executor.execute_one(&mut claimed).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::DeadLettered { .. }));
    }

    #[tokio::test]
    async fn spawned_executor_drains_the_store() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone(), SystemClock::shared());
        executor.register_handler("*", Arc::new(Succeeds));

        for i in 0..5 {
            enqueue(&store, JobKind::custom(format!("job-{i}")), 0);
        }

        let handle = executor.spawn(
            JobExecutorConfig::default()
                .with_name("test")
                .with_poll_interval(Duration::from_millis(5)),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.stats().jobs_succeeded < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        handle.shutdown().await;
        assert_eq!(store.stats().unwrap().completed, 5);
    }
}
