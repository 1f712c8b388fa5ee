use async_trait::async_trait;
use tracing::{debug, info};

use refsync_events::{BusError, Envelope, EventPublisher};
use refsync_refresh::{RefreshError, RefreshStateMachine, RefreshStatus};

use crate::jobs::{FailureKind, Job, JobFailure, JobHandler, JobResult};

fn bus_failure(e: BusError) -> JobFailure {
    let kind = match &e {
        BusError::Connection(_) | BusError::Channel(_) | BusError::Nacked(_) => {
            FailureKind::Transient
        }
        BusError::UnknownExchange(_)
        | BusError::UnknownSubscription(_)
        | BusError::Unroutable { .. }
        | BusError::Closed => {
            FailureKind::MissingDependency
        }
        BusError::Serialization(_) => FailureKind::Data,
    };
    JobFailure::new(kind, e.to_string())
}

fn refresh_failure(e: RefreshError) -> JobFailure {
    let kind = if e.is_transient() {
        FailureKind::Transient
    } else {
        FailureKind::Other
    };
    JobFailure::new(kind, e.to_string())
}

/// Scheduled job that starts a refresh run and asks the workers to execute it.
///
/// A run that is already being processed is left alone; a run stuck in
/// `Scheduled` has its `Refresh` request published again.
pub struct RefreshTrigger {
    state: RefreshStateMachine,
    publisher: EventPublisher,
}

impl RefreshTrigger {
    pub fn new(state: RefreshStateMachine, publisher: EventPublisher) -> Self {
        Self { state, publisher }
    }

    async fn trigger(&self) -> Result<(), JobFailure> {
        let (id, _) = self.state.init().await.map_err(refresh_failure)?;
        let status = self
            .state
            .try_get_progress(&id)
            .await
            .map_err(refresh_failure)?
            .map_or(RefreshStatus::None, |p| p.status());

        let request = Envelope::refresh(id.clone(), self.state.now());
        match status {
            RefreshStatus::None => {
                self.state
                    .set_scheduled(&id, request.message_id())
                    .await
                    .map_err(refresh_failure)?;
            }
            RefreshStatus::Scheduled => {
                info!(correlation_id = %id, "run still scheduled, publishing refresh again");
            }
            other => {
                debug!(correlation_id = %id, status = %other, "run already in flight, nothing to trigger");
                return Ok(());
            }
        }

        self.publisher.publish(&request).await.map_err(bus_failure)?;
        info!(correlation_id = %id, subject = %self.state.subject(), "refresh requested");
        Ok(())
    }
}

impl core::fmt::Debug for RefreshTrigger {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RefreshTrigger")
            .field("subject", self.state.subject())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl JobHandler for RefreshTrigger {
    async fn run(&self, job: &Job) -> JobResult {
        debug!(job_id = %job.id, attempt = job.attempt + 1, "triggering refresh");
        match self.trigger().await {
            Ok(()) => JobResult::Success,
            Err(failure) => JobResult::Failure(failure),
        }
    }
}
