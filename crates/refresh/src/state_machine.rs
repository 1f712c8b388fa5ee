use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use refsync_core::{CorrelationId, MessageId, SharedClock, Subject};

use crate::error::RefreshError;
use crate::progress::{Applied, RefreshProgress, Transition};
use crate::store::ProgressStore;

/// Drives refresh runs of one subject through their lifecycle.
///
/// Every operation is a read-modify-write against the progress store; the
/// state machine itself holds no run state and may be shared freely.
#[derive(Clone)]
pub struct RefreshStateMachine {
    subject: Subject,
    store: Arc<dyn ProgressStore>,
    clock: SharedClock,
    expiry: Duration,
}

impl RefreshStateMachine {
    pub fn new(
        subject: Subject,
        store: Arc<dyn ProgressStore>,
        clock: SharedClock,
        expiry: Duration,
    ) -> Self {
        Self {
            subject,
            store,
            clock,
            expiry,
        }
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// Time a transient run may go without progress before it is superseded.
    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Start a run for the subject, or return the one already in flight.
    #[instrument(skip(self), fields(subject = %self.subject), err)]
    pub async fn init(&self) -> Result<(CorrelationId, DateTime<Utc>), RefreshError> {
        if let Some(active) = self.live_active().await? {
            debug!(correlation_id = %active.correlation_id(), "run already in flight");
            return Ok((active.correlation_id().clone(), active.started_at()));
        }

        let progress = self.begin(CorrelationId::generate()).await?;
        Ok((progress.correlation_id().clone(), progress.started_at()))
    }

    /// Take over a run whose id was allocated elsewhere.
    ///
    /// Returns the stored record if the run is known. Otherwise starts it,
    /// unless another live run holds the subject.
    #[instrument(skip(self), fields(subject = %self.subject), err)]
    pub async fn adopt(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<RefreshProgress, RefreshError> {
        if let Some(existing) = self.store.get(&self.subject, correlation_id).await? {
            return Ok(existing);
        }

        if let Some(active) = self.live_active().await? {
            if active.correlation_id() != correlation_id {
                return Err(RefreshError::Busy {
                    active: active.correlation_id().clone(),
                });
            }
        }

        self.begin(correlation_id.clone()).await
    }

    /// Release the subject; the next `init` starts a new run.
    #[instrument(skip(self), fields(subject = %self.subject), err)]
    pub async fn reset(&self) -> Result<(), RefreshError> {
        self.store.clear_active(&self.subject).await?;
        info!("refresh subject reset");
        Ok(())
    }

    pub async fn set_scheduled(
        &self,
        correlation_id: &CorrelationId,
        message_id: MessageId,
    ) -> Result<RefreshProgress, RefreshError> {
        self.transition(correlation_id, message_id, Transition::Schedule)
            .await
    }

    pub async fn set_processing(
        &self,
        correlation_id: &CorrelationId,
        message_id: MessageId,
    ) -> Result<RefreshProgress, RefreshError> {
        self.transition(correlation_id, message_id, Transition::Process)
            .await
    }

    /// Record the running total of downloaded rows.
    pub async fn set_downloading(
        &self,
        correlation_id: &CorrelationId,
        message_id: MessageId,
        count: u64,
    ) -> Result<RefreshProgress, RefreshError> {
        self.transition(correlation_id, message_id, Transition::Download { count })
            .await
    }

    /// Record the running total of saved rows.
    pub async fn set_saving(
        &self,
        correlation_id: &CorrelationId,
        message_id: MessageId,
        count: u64,
    ) -> Result<RefreshProgress, RefreshError> {
        self.transition(correlation_id, message_id, Transition::Save { count })
            .await
    }

    pub async fn set_completed(
        &self,
        correlation_id: &CorrelationId,
        message_id: MessageId,
        affected: u64,
    ) -> Result<RefreshProgress, RefreshError> {
        self.transition(correlation_id, message_id, Transition::Complete { affected })
            .await
    }

    pub async fn set_failed(
        &self,
        correlation_id: &CorrelationId,
        message_id: MessageId,
        error_message: impl Into<String>,
    ) -> Result<RefreshProgress, RefreshError> {
        let error = error_message.into();
        self.transition(correlation_id, message_id, Transition::Fail { error })
            .await
    }

    pub async fn try_get_progress(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<RefreshProgress>, RefreshError> {
        Ok(self.store.get(&self.subject, correlation_id).await?)
    }

    /// The run currently holding the subject, whatever its status.
    pub async fn try_get_active(&self) -> Result<Option<RefreshProgress>, RefreshError> {
        match self.store.active(&self.subject).await? {
            Some(id) => Ok(self.store.get(&self.subject, &id).await?),
            None => Ok(None),
        }
    }

    async fn live_active(&self) -> Result<Option<RefreshProgress>, RefreshError> {
        let now = self.clock.now();
        Ok(self
            .try_get_active()
            .await?
            .filter(|p| p.is_live(now, self.expiry)))
    }

    async fn begin(&self, correlation_id: CorrelationId) -> Result<RefreshProgress, RefreshError> {
        let progress = RefreshProgress::new(self.subject.clone(), correlation_id, self.clock.now());
        self.store.put(&progress, self.expiry).await?;
        self.store
            .set_active(&self.subject, progress.correlation_id(), self.expiry)
            .await?;
        info!(correlation_id = %progress.correlation_id(), "refresh run started");
        Ok(progress)
    }

    #[instrument(
        skip(self, transition),
        fields(subject = %self.subject, to = %transition.target()),
        err
    )]
    async fn transition(
        &self,
        correlation_id: &CorrelationId,
        message_id: MessageId,
        transition: Transition,
    ) -> Result<RefreshProgress, RefreshError> {
        let current = self
            .store
            .get(&self.subject, correlation_id)
            .await?
            .ok_or_else(|| RefreshError::NotFound(correlation_id.clone()))?;

        let next = match current.apply(transition, message_id, self.clock.now()) {
            Ok(Applied::Updated(next)) => next,
            Ok(Applied::Replayed) => {
                debug!(status = %current.status(), "transition replayed");
                return Ok(current);
            }
            Err(e) => {
                warn!(from = %current.status(), error = %e, "transition rejected");
                return Err(e);
            }
        };

        self.store.put(&next, self.expiry).await?;

        // Keep the subject pointer alive for as long as the run makes progress.
        if self.store.active(&self.subject).await?.as_ref() == Some(correlation_id) {
            self.store
                .set_active(&self.subject, correlation_id, self.expiry)
                .await?;
        }

        if next.is_terminal() {
            info!(
                status = %next.status(),
                saved_count = next.saved_count(),
                duration_ms = next.duration().num_milliseconds(),
                "refresh run finished"
            );
        }
        Ok(next)
    }
}

impl core::fmt::Debug for RefreshStateMachine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RefreshStateMachine")
            .field("subject", &self.subject)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::RefreshStatus;
    use crate::store::InMemoryProgressStore;
    use refsync_core::{Clock, ManualClock};

    const EXPIRY: Duration = Duration::from_secs(600);

    fn machine() -> (RefreshStateMachine, Arc<ManualClock>) {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryProgressStore::with_clock(clock.clone()));
        let sm = RefreshStateMachine::new(
            Subject::new("securities").unwrap(),
            store,
            clock.clone(),
            EXPIRY,
        );
        (sm, clock)
    }

    #[tokio::test]
    async fn full_run_records_duration_and_counts() {
        let (sm, clock) = machine();
        let m = MessageId::new();
        let (id, started_at) = sm.init().await.unwrap();

        let mut last = started_at;
        let mut check = |p: RefreshProgress| {
            assert!(p.updated_at() >= last);
            last = p.updated_at();
            p
        };

        check(sm.set_scheduled(&id, m).await.unwrap());
        clock.advance(Duration::from_secs(1));
        check(sm.set_processing(&id, m).await.unwrap());
        clock.advance(Duration::from_secs(1));
        check(sm.set_downloading(&id, m, 100).await.unwrap());
        clock.advance(Duration::from_secs(1));
        check(sm.set_saving(&id, m, 100).await.unwrap());
        clock.advance(Duration::from_secs(1));
        let done = check(sm.set_completed(&id, m, 100).await.unwrap());

        assert_eq!(done.status(), RefreshStatus::Completed);
        assert_eq!(done.saved_count(), 100);
        assert_eq!(done.duration(), chrono::Duration::seconds(4));
        assert_eq!(done.duration(), done.updated_at() - done.started_at());
        assert_eq!(sm.try_get_progress(&id).await.unwrap(), Some(done));
    }

    #[tokio::test]
    async fn saving_before_scheduling_is_rejected() {
        let (sm, _) = machine();
        let (id, _) = sm.init().await.unwrap();
        let err = sm.set_saving(&id, MessageId::new(), 1).await.unwrap_err();
        assert!(matches!(err, RefreshError::InvalidTransition { .. }));

        let stored = sm.try_get_progress(&id).await.unwrap().unwrap();
        assert_eq!(stored.status(), RefreshStatus::None);
    }

    #[tokio::test]
    async fn init_is_idempotent_until_the_run_expires() {
        let (sm, clock) = machine();
        let (first, _) = sm.init().await.unwrap();
        let (again, _) = sm.init().await.unwrap();
        assert_eq!(first, again);

        clock.advance(EXPIRY + Duration::from_secs(1));
        let (superseding, _) = sm.init().await.unwrap();
        assert_ne!(first, superseding);
    }

    #[tokio::test]
    async fn init_after_terminal_run_starts_a_new_one() {
        let (sm, _) = machine();
        let m = MessageId::new();
        let (first, _) = sm.init().await.unwrap();
        sm.set_scheduled(&first, m).await.unwrap();
        sm.set_failed(&first, m, "provider unreachable").await.unwrap();

        let (second, _) = sm.init().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(
            sm.try_get_progress(&first).await.unwrap().unwrap().error_message(),
            "provider unreachable"
        );
    }

    #[tokio::test]
    async fn progress_keeps_the_run_active_past_its_initial_ttl() {
        let (sm, clock) = machine();
        let m = MessageId::new();
        let (id, _) = sm.init().await.unwrap();
        sm.set_scheduled(&id, m).await.unwrap();
        sm.set_processing(&id, m).await.unwrap();

        for total in 1..=3 {
            clock.advance(EXPIRY / 2 + Duration::from_secs(1));
            sm.set_downloading(&id, m, total * 10).await.unwrap();
        }

        let (same, _) = sm.init().await.unwrap();
        assert_eq!(same, id);
    }

    #[tokio::test]
    async fn replayed_transition_returns_the_stored_record() {
        let (sm, clock) = machine();
        let m = MessageId::new();
        let (id, _) = sm.init().await.unwrap();
        let scheduled = sm.set_scheduled(&id, m).await.unwrap();
        clock.advance(Duration::from_secs(5));
        assert_eq!(sm.set_scheduled(&id, m).await.unwrap(), scheduled);
    }

    #[tokio::test]
    async fn adopt_refuses_while_another_run_is_live() {
        let (sm, _) = machine();
        let (live, _) = sm.init().await.unwrap();

        let other = CorrelationId::parse("external-1").unwrap();
        let err = sm.adopt(&other).await.unwrap_err();
        assert!(matches!(err, RefreshError::Busy { active } if active == live));

        // Adopting the live run resumes it.
        let resumed = sm.adopt(&live).await.unwrap();
        assert_eq!(resumed.correlation_id(), &live);
    }

    #[tokio::test]
    async fn reset_releases_the_subject() {
        let (sm, _) = machine();
        let (first, _) = sm.init().await.unwrap();
        sm.reset().await.unwrap();
        assert!(sm.try_get_active().await.unwrap().is_none());

        let (second, _) = sm.init().await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let (sm, _) = machine();
        let missing = CorrelationId::parse("nope").unwrap();
        assert!(sm.try_get_progress(&missing).await.unwrap().is_none());
        let err = sm.set_processing(&missing, MessageId::new()).await.unwrap_err();
        assert!(matches!(err, RefreshError::NotFound(_)));
    }
}
