//! Where jobs wait between attempts, and where they go when they give up.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use super::types::{DeadLetterEntry, Job, JobId, JobKind, JobStatus};

pub trait JobStore: Send + Sync {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Claim the oldest job that is ready at `now` and mark it running.
    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    /// A non-terminal job of `kind`, if any.
    fn in_flight(&self, kind: &JobKind) -> Result<Option<Job>, JobStoreError>;

    /// Park a job that will not run again, with the reason it stopped.
    fn dead_letter(&self, job: Job, reason: String, now: DateTime<Utc>)
    -> Result<(), JobStoreError>;

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    /// Move a dead-lettered job back to pending with a fresh attempt budget.
    fn retry_dead_letter(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError>;

    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(now)
    }

    fn in_flight(&self, kind: &JobKind) -> Result<Option<Job>, JobStoreError> {
        (**self).in_flight(kind)
    }

    fn dead_letter(
        &self,
        job: Job,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        (**self).dead_letter(job, reason, now)
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        (**self).list_dead_letters(limit)
    }

    fn retry_dead_letter(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        (**self).retry_dead_letter(job_id, now)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("no job with id {0}")]
    NotFound(JobId),
    #[error("job {0} is already enqueued")]
    AlreadyExists(JobId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

/// Process-local store. Jobs do not survive a restart.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = write(&self.jobs);
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        if let Some(job) = read(&self.jobs).get(&job_id) {
            return Ok(Some(job.clone()));
        }
        Ok(read(&self.dead_letters).get(&job_id).map(|e| e.job.clone()))
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = write(&self.jobs);
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = write(&self.jobs);

        let next = jobs
            .values()
            .filter(|j| {
                matches!(j.status, JobStatus::Pending | JobStatus::Failed { .. }) && j.is_ready(now)
            })
            .min_by_key(|j| (j.scheduled_at.unwrap_or(j.created_at), j.created_at))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.mark_running(now);
                job.clone()
            })
        }))
    }

    fn in_flight(&self, kind: &JobKind) -> Result<Option<Job>, JobStoreError> {
        Ok(read(&self.jobs)
            .values()
            .find(|j| &j.kind == kind && j.status.is_in_flight())
            .cloned())
    }

    fn dead_letter(
        &self,
        mut job: Job,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut jobs = write(&self.jobs);
        let mut dls = write(&self.dead_letters);

        job.status = JobStatus::DeadLettered {
            error: reason.clone(),
            attempts: job.attempt,
        };
        job.updated_at = now;

        jobs.remove(&job.id);
        dls.insert(job.id, DeadLetterEntry::new(job, reason, now));
        Ok(())
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let mut result: Vec<_> = read(&self.dead_letters).values().cloned().collect();
        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    fn retry_dead_letter(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut jobs = write(&self.jobs);
        let entry = write(&self.dead_letters)
            .remove(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;

        let job = Job {
            status: JobStatus::Pending,
            attempt: 0,
            scheduled_at: None,
            updated_at: now,
            history: Vec::new(),
            ..entry.job
        };
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let mut stats = JobStats {
            dead_lettered: read(&self.dead_letters).len(),
            ..JobStats::default()
        };
        for job in read(&self.jobs).values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::DeadLettered { .. } => stats.dead_lettered += 1,
            }
        }
        Ok(stats)
    }
}
