//! Consumer of `{subject}.refresh`: runs one refresh end to end.
//!
//! ```text
//! adopt -> Processing -> Start
//!       -> page/convert/Download + Refreshing (until an empty or short page)
//!       -> upsert/Save per batch -> Completed -> Complete
//! ```
//!
//! Download counts only move while the run is `Processing`, so every page is
//! fetched before the first batch is saved. A redelivered request resumes the
//! run it started; any other request for a run already past `Scheduled` is
//! acknowledged as a duplicate.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use refsync_converter::{ConvertError, convert};
use refsync_core::{CorrelationId, MessageId};
use refsync_events::{
    BusError, Delivery, Envelope, EventPublisher, HandlerOutcome, MessageHandler, RefreshMessage,
};
use refsync_refresh::{RefreshError, RefreshProgress, RefreshStateMachine, RefreshStatus};
use refsync_securities::Security;

use crate::repository::{RepositoryError, SecurityRepository};
use crate::source::{MarketDataSource, SourceError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("conversion failed: {0}")]
    Convert(#[from] ConvertError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Refresh(#[from] RefreshError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("refresh cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Failures worth another delivery.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Source(e) => e.is_transient(),
            PipelineError::Repository(e) => e.is_transient(),
            PipelineError::Refresh(e) => e.is_transient(),
            PipelineError::Bus(e) => e.is_transient(),
            PipelineError::Convert(_) => false,
            PipelineError::Cancelled => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefreshWorkerConfig {
    /// Rows per provider page and per repository batch.
    pub page_size: usize,
}

impl Default for RefreshWorkerConfig {
    fn default() -> Self {
        Self { page_size: 100 }
    }
}

pub struct RefreshWorker {
    state: RefreshStateMachine,
    publisher: EventPublisher,
    source: Arc<dyn MarketDataSource>,
    repository: Arc<dyn SecurityRepository>,
    config: RefreshWorkerConfig,
}

/// One request being executed.
struct Run<'a> {
    id: &'a CorrelationId,
    message_id: MessageId,
    request: &'a Envelope,
}

impl RefreshWorker {
    pub fn new(
        state: RefreshStateMachine,
        publisher: EventPublisher,
        source: Arc<dyn MarketDataSource>,
        repository: Arc<dyn SecurityRepository>,
    ) -> Self {
        Self {
            state,
            publisher,
            source,
            repository,
            config: RefreshWorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RefreshWorkerConfig) -> Self {
        self.config = RefreshWorkerConfig {
            page_size: config.page_size.max(1),
        };
        self
    }

    async fn emit(&self, run: &Run<'_>, envelope: Envelope) -> Result<(), PipelineError> {
        self.publisher.publish(&envelope.caused_by(run.request)).await?;
        Ok(())
    }

    /// Bring the run to `Processing`. `None` means the request is a duplicate.
    async fn start(&self, run: &Run<'_>) -> Result<Option<RefreshProgress>, PipelineError> {
        let progress = match self.state.adopt(run.id).await {
            Ok(progress) => progress,
            Err(RefreshError::Busy { active }) => {
                warn!(correlation_id = %run.id, %active, "another run holds the subject, dropping request");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match progress.status() {
            RefreshStatus::None => {
                self.state.set_scheduled(run.id, run.message_id).await?;
            }
            RefreshStatus::Scheduled => {}
            RefreshStatus::Processing | RefreshStatus::Saving
                if progress.message_id() == Some(run.message_id) =>
            {
                info!(correlation_id = %run.id, status = %progress.status(), "resuming run");
                return Ok(Some(progress));
            }
            status => {
                debug!(correlation_id = %run.id, %status, "run already handled, dropping request");
                return Ok(None);
            }
        }

        let progress = self.state.set_processing(run.id, run.message_id).await?;
        self.emit(
            run,
            Envelope::start(
                run.id.clone(),
                format!("refreshing {}", self.state.subject()),
                self.state.now(),
            ),
        )
        .await?;
        Ok(Some(progress))
    }

    async fn download(
        &self,
        run: &Run<'_>,
        record_progress: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Security>, PipelineError> {
        let page_size = self.config.page_size;
        let mut records = Vec::new();
        let mut start = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let page = self.source.fetch_page(start, page_size).await?;
            if page.is_empty() {
                break;
            }
            let rows = page.row_count();
            records.extend(convert::<Security>(&page)?);

            if record_progress {
                let total = records.len() as u64;
                self.state
                    .set_downloading(run.id, run.message_id, total)
                    .await?;
                self.emit(
                    run,
                    Envelope::refreshing(run.id.clone(), total, self.state.now()),
                )
                .await?;
            }
            debug!(correlation_id = %run.id, start, rows, "page downloaded");

            if rows < page_size {
                break;
            }
            start += rows;
        }

        Ok(records)
    }

    async fn save(
        &self,
        run: &Run<'_>,
        records: &[Security],
        cancel: &CancellationToken,
    ) -> Result<u64, PipelineError> {
        let mut saved = 0u64;
        let mut affected = 0u64;

        // An empty listing still passes through Saving.
        if records.is_empty() {
            self.state.set_saving(run.id, run.message_id, 0).await?;
        }

        for batch in records.chunks(self.config.page_size) {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            affected += self.repository.upsert(batch).await?;
            saved += batch.len() as u64;
            self.state.set_saving(run.id, run.message_id, saved).await?;
        }

        Ok(affected)
    }

    async fn execute(
        &self,
        run: &Run<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let Some(progress) = self.start(run).await? else {
            return Ok(());
        };

        let records = self
            .download(run, progress.status() == RefreshStatus::Processing, cancel)
            .await?;
        let affected = self.save(run, &records, cancel).await?;

        let done = self
            .state
            .set_completed(run.id, run.message_id, affected)
            .await?;
        self.emit(
            run,
            Envelope::complete(run.id.clone(), affected, done.started_at(), done.updated_at()),
        )
        .await?;
        Ok(())
    }

    /// Mark the run failed and announce it. Skipped for runs that already
    /// reached a terminal state.
    async fn fail(&self, run: &Run<'_>, error: &PipelineError) {
        let summary = error.to_string();
        let failed = match self.state.set_failed(run.id, run.message_id, &summary).await {
            Ok(failed) => failed,
            Err(RefreshError::InvalidTransition { from, .. }) if from.is_terminal() => {
                debug!(correlation_id = %run.id, status = %from, "run already finished");
                return;
            }
            Err(e) => {
                error!(correlation_id = %run.id, error = %e, "could not record failure");
                return;
            }
        };

        let event = Envelope::error(run.id.clone(), summary, failed.started_at(), failed.updated_at());
        if let Err(e) = self.emit(run, event).await {
            error!(correlation_id = %run.id, error = %e, "could not publish error event");
        }
    }
}

impl core::fmt::Debug for RefreshWorker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RefreshWorker")
            .field("subject", self.state.subject())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MessageHandler for RefreshWorker {
    #[instrument(
        skip(self, delivery, cancel),
        fields(
            message_id = %delivery.envelope.message_id(),
            redelivery_count = delivery.redelivery_count
        )
    )]
    async fn handle(&self, delivery: &Delivery, cancel: &CancellationToken) -> HandlerOutcome {
        let RefreshMessage::Refresh { operation_id } = delivery.envelope.message() else {
            return HandlerOutcome::reject(format!(
                "unexpected {} message on refresh queue",
                delivery.envelope.message_type()
            ));
        };

        let run = Run {
            id: operation_id,
            message_id: delivery.envelope.message_id(),
            request: &delivery.envelope,
        };

        match self.execute(&run, cancel).await {
            Ok(()) => HandlerOutcome::Ack,
            Err(PipelineError::Cancelled) => HandlerOutcome::retry("cancelled"),
            Err(e) if e.is_transient() && !delivery.is_final_attempt() => {
                warn!(correlation_id = %run.id, error = %e, "refresh failed, will retry");
                HandlerOutcome::retry(e.to_string())
            }
            Err(e) if e.is_transient() => {
                error!(correlation_id = %run.id, error = %e, "refresh failed on final attempt");
                self.fail(&run, &e).await;
                HandlerOutcome::retry(e.to_string())
            }
            Err(e) => {
                error!(correlation_id = %run.id, error = %e, "refresh failed");
                self.fail(&run, &e).await;
                HandlerOutcome::Ack
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use refsync_converter::TabularResponse;
    use refsync_core::{ManualClock, Subject};
    use refsync_events::{InMemoryBroker, Topology};
    use refsync_refresh::InMemoryProgressStore;
    use serde_json::json;

    use crate::repository::InMemorySecurityRepository;
    use crate::source::StaticSource;

    fn listing(rows: usize) -> TabularResponse {
        let document = json!({
            "securities": {
                "columns": ["secid", "is_traded"],
                "metadata": {"secid": {"type": "string"}, "is_traded": {"type": "int32"}},
                "data": (0..rows).map(|i| json!([format!("SEC{i}"), 1])).collect::<Vec<_>>(),
            }
        });
        TabularResponse::from_json_block(&document, "securities").unwrap()
    }

    /// Fails the first `failures` fetches with a transient error.
    struct Flaky {
        inner: StaticSource,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl MarketDataSource for Flaky {
        async fn fetch_page(
            &self,
            start: usize,
            limit: usize,
        ) -> Result<TabularResponse, SourceError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SourceError::Unavailable("connection reset".into()));
            }
            self.inner.fetch_page(start, limit).await
        }
    }

    struct Harness {
        worker: RefreshWorker,
        state: RefreshStateMachine,
        repository: Arc<InMemorySecurityRepository>,
    }

    async fn harness(source: Arc<dyn MarketDataSource>) -> Harness {
        let clock = ManualClock::starting_now();
        let subject = Subject::new("securities").unwrap();
        let store = Arc::new(InMemoryProgressStore::with_clock(clock.clone()));
        let state =
            RefreshStateMachine::new(subject.clone(), store, clock, Duration::from_secs(900));
        let broker = Arc::new(InMemoryBroker::default());
        let publisher = EventPublisher::new(broker, Topology::new(subject));
        publisher.declare_topology().await.unwrap();
        let repository = InMemorySecurityRepository::arc();
        let worker = RefreshWorker::new(state.clone(), publisher, source, repository.clone())
            .with_config(RefreshWorkerConfig { page_size: 40 });
        Harness {
            worker,
            state,
            repository,
        }
    }

    fn delivery(envelope: Envelope, redelivery_count: u32) -> Delivery {
        Delivery {
            envelope,
            exchange: "securities".into(),
            routing_key: "securities.refresh".into(),
            redelivery_count,
            max_redeliveries: 2,
        }
    }

    fn request(id: &str) -> Envelope {
        Envelope::refresh(CorrelationId::parse(id).unwrap(), chrono::Utc::now())
    }

    #[tokio::test]
    async fn pages_through_the_listing_and_completes() {
        let h = harness(Arc::new(StaticSource::new(listing(100)))).await;
        let id = CorrelationId::parse("r1").unwrap();

        let outcome = h
            .worker
            .handle(&delivery(request("r1"), 0), &CancellationToken::new())
            .await;
        assert_eq!(outcome, HandlerOutcome::Ack);

        let progress = h.state.try_get_progress(&id).await.unwrap().unwrap();
        assert_eq!(progress.status(), RefreshStatus::Completed);
        assert_eq!(progress.downloaded_count(), 100);
        assert_eq!(progress.saved_count(), 100);
        assert_eq!(h.repository.len(), 100);
        assert_eq!(h.repository.get("SEC7").unwrap().is_traded, Some(true));
    }

    #[tokio::test]
    async fn transient_failure_asks_for_redelivery_and_resumes() {
        let source = Arc::new(Flaky {
            inner: StaticSource::new(listing(10)),
            failures: AtomicUsize::new(1),
        });
        let h = harness(source).await;
        let id = CorrelationId::parse("r2").unwrap();
        let envelope = request("r2");
        let cancel = CancellationToken::new();

        let first = h.worker.handle(&delivery(envelope.clone(), 0), &cancel).await;
        assert!(matches!(first, HandlerOutcome::Retry(_)));
        assert_eq!(
            h.state.try_get_progress(&id).await.unwrap().unwrap().status(),
            RefreshStatus::Processing
        );

        let second = h.worker.handle(&delivery(envelope, 1), &cancel).await;
        assert_eq!(second, HandlerOutcome::Ack);
        assert_eq!(
            h.state.try_get_progress(&id).await.unwrap().unwrap().status(),
            RefreshStatus::Completed
        );
    }

    #[tokio::test]
    async fn final_attempt_records_failure_before_dead_lettering() {
        let source = Arc::new(Flaky {
            inner: StaticSource::new(listing(10)),
            failures: AtomicUsize::new(usize::MAX),
        });
        let h = harness(source).await;
        let id = CorrelationId::parse("r3").unwrap();

        let outcome = h
            .worker
            .handle(&delivery(request("r3"), 2), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, HandlerOutcome::Retry(_)));

        let progress = h.state.try_get_progress(&id).await.unwrap().unwrap();
        assert_eq!(progress.status(), RefreshStatus::Failed);
        assert!(progress.error_message().contains("connection reset"));
    }

    #[tokio::test]
    async fn schema_drift_fails_the_run_without_retry() {
        let document = json!({
            "securities": {
                "columns": ["secid", "listlevel"],
                "metadata": {"secid": {"type": "string"}, "listlevel": {"type": "int32"}},
                "data": [["SBER", 1]],
            }
        });
        let drifted = TabularResponse::from_json_block(&document, "securities").unwrap();
        let h = harness(Arc::new(StaticSource::new(drifted))).await;
        let id = CorrelationId::parse("r4").unwrap();

        let outcome = h
            .worker
            .handle(&delivery(request("r4"), 0), &CancellationToken::new())
            .await;
        assert_eq!(outcome, HandlerOutcome::Ack);

        let progress = h.state.try_get_progress(&id).await.unwrap().unwrap();
        assert_eq!(progress.status(), RefreshStatus::Failed);
        assert!(progress.error_message().contains("listlevel"));
        assert!(h.repository.is_empty());
    }

    #[tokio::test]
    async fn second_request_for_a_running_run_is_a_duplicate() {
        let h = harness(Arc::new(StaticSource::new(listing(3)))).await;
        let id = CorrelationId::parse("r5").unwrap();
        let cancel = CancellationToken::new();

        assert_eq!(
            h.worker.handle(&delivery(request("r5"), 0), &cancel).await,
            HandlerOutcome::Ack
        );
        let before = h.state.try_get_progress(&id).await.unwrap().unwrap();

        assert_eq!(
            h.worker.handle(&delivery(request("r5"), 0), &cancel).await,
            HandlerOutcome::Ack
        );
        assert_eq!(h.state.try_get_progress(&id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn non_refresh_messages_are_rejected() {
        let h = harness(Arc::new(StaticSource::default())).await;
        let start = Envelope::start(CorrelationId::parse("r6").unwrap(), "", chrono::Utc::now());
        let outcome = h
            .worker
            .handle(&delivery(start, 0), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, HandlerOutcome::Reject(_)));
    }
}
