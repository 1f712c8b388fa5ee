use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use refsync_core::{SharedClock, SystemClock};
use refsync_events::{
    Binding, BusOptions, EventPublisher, MessageBus, MessageKind, SubscriptionHandle, Topology,
};
use refsync_infra::config::{BrokerSettings, Settings};
use refsync_infra::jobs::{
    Cadence, InMemoryJobStore, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobKind,
    JobSchedule, RetryPolicy, Scheduler,
};
use refsync_infra::repository::{
    InMemorySecurityRepository, PostgresSecurityRepository, SecurityRepository,
};
use refsync_infra::source::{IssHttpSource, MarketDataSource};
use refsync_infra::workers::{
    NotificationWorker, Notifier, RefreshTrigger, RefreshWorker, RefreshWorkerConfig,
    TracingNotifier,
};
use refsync_refresh::{InMemoryProgressStore, ProgressStore, RefreshStateMachine};

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);
const SCHEDULER_POLL: Duration = Duration::from_secs(1);

/// External collaborators of the worker.
pub struct Components {
    pub clock: SharedClock,
    pub bus: Arc<dyn MessageBus>,
    pub progress: Arc<dyn ProgressStore>,
    pub repository: Arc<dyn SecurityRepository>,
    pub source: Arc<dyn MarketDataSource>,
    pub notifier: Arc<dyn Notifier>,
}

pub fn bus_options(broker: &BrokerSettings) -> BusOptions {
    BusOptions::default()
        .with_prefetch(broker.prefetch)
        .with_max_redeliveries(broker.max_redelivery)
        .with_dead_letter_exchange(broker.dead_letter_exchange.clone())
}

#[cfg(feature = "amqp")]
fn connect_bus(settings: &Settings) -> Arc<dyn MessageBus> {
    Arc::new(refsync_infra::amqp::AmqpMessageBus::new(
        settings.broker.uri(),
        bus_options(&settings.broker),
    ))
}

#[cfg(not(feature = "amqp"))]
fn connect_bus(settings: &Settings) -> Arc<dyn MessageBus> {
    warn!("built without amqp support, using in-process broker");
    Arc::new(refsync_events::InMemoryBroker::new(bus_options(
        &settings.broker,
    )))
}

#[cfg(feature = "redis")]
fn connect_progress(settings: &Settings, _clock: &SharedClock) -> anyhow::Result<Arc<dyn ProgressStore>> {
    let store = refsync_infra::progress_store::RedisProgressStore::new(&settings.store)
        .context("configuring progress store")?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
fn connect_progress(_settings: &Settings, clock: &SharedClock) -> anyhow::Result<Arc<dyn ProgressStore>> {
    warn!("built without redis support, progress is kept in memory");
    Ok(Arc::new(InMemoryProgressStore::with_clock(clock.clone())))
}

/// A configured worker, not yet consuming.
pub struct App {
    settings: Settings,
    components: Components,
}

impl App {
    /// Connect to everything `settings` names.
    pub async fn build(settings: Settings) -> anyhow::Result<Self> {
        let clock = SystemClock::shared();

        let repository: Arc<dyn SecurityRepository> = match &settings.database_url {
            Some(url) => Arc::new(
                PostgresSecurityRepository::connect(url)
                    .await
                    .context("connecting to database")?,
            ),
            None => {
                warn!("DATABASE_URL not set, securities are kept in memory");
                InMemorySecurityRepository::arc()
            }
        };

        let components = Components {
            bus: connect_bus(&settings),
            progress: connect_progress(&settings, &clock)?,
            repository,
            source: Arc::new(
                IssHttpSource::new(&settings.provider, PROVIDER_TIMEOUT)
                    .context("configuring market-data source")?,
            ),
            notifier: Arc::new(TracingNotifier),
            clock,
        };
        Ok(Self::from_parts(settings, components))
    }

    pub fn from_parts(settings: Settings, components: Components) -> Self {
        Self {
            settings,
            components,
        }
    }

    /// Same wiring with everything in process.
    pub fn in_memory(
        settings: Settings,
        clock: SharedClock,
        source: Arc<dyn MarketDataSource>,
    ) -> Self {
        let bus = Arc::new(refsync_events::InMemoryBroker::new(bus_options(
            &settings.broker,
        )));
        let components = Components {
            bus,
            progress: Arc::new(InMemoryProgressStore::with_clock(clock.clone())),
            repository: InMemorySecurityRepository::arc(),
            source,
            notifier: Arc::new(TracingNotifier),
            clock,
        };
        Self::from_parts(settings, components)
    }

    fn topology(&self) -> Topology {
        Topology::new(self.settings.refresh.subject.clone())
            .with_dead_letter_exchange(self.settings.broker.dead_letter_exchange.clone())
    }

    fn schedule(&self) -> anyhow::Result<JobSchedule> {
        let jobs = &self.settings.jobs;
        let cadence = match &jobs.cron {
            Some(expression) => Cadence::cron(expression)?,
            None => Cadence::interval(jobs.delay)?,
        };
        Ok(
            JobSchedule::new(JobKind::refresh(self.settings.refresh.subject.as_str()), cadence)
                .run_on_startup(jobs.run_on_startup)
                .with_retry_policy(RetryPolicy::from_max_retry_count(
                    jobs.max_retry_count,
                    jobs.delay,
                )),
        )
    }

    /// Declare the topology, subscribe the workers and start the scheduler.
    pub async fn start(self) -> anyhow::Result<RunningApp> {
        let Components {
            clock,
            bus,
            progress,
            repository,
            source,
            notifier,
        } = &self.components;
        let topology = self.topology();
        let subject = topology.subject().clone();

        let publisher = EventPublisher::new(bus.clone(), topology.clone());
        publisher
            .declare_topology()
            .await
            .context("declaring broker topology")?;
        bus.declare_queue(&topology.dead_letter_binding())
            .await
            .context("declaring dead-letter queue")?;

        let state = RefreshStateMachine::new(
            subject.clone(),
            progress.clone(),
            clock.clone(),
            self.settings.refresh.expiry,
        );

        let mut subscriptions = Vec::new();

        let worker = RefreshWorker::new(
            state.clone(),
            publisher.clone(),
            source.clone(),
            repository.clone(),
        )
        .with_config(RefreshWorkerConfig {
            page_size: self.settings.provider.page_size as usize,
        });
        let refresh = Binding::new(topology.queue_name("refresh"), topology.subject_exchange())
            .key(topology.routing_key(MessageKind::Refresh));
        subscriptions.push(bus.subscribe(refresh, Arc::new(worker)).await?);

        let notifications = [MessageKind::Start, MessageKind::Complete, MessageKind::Error]
            .into_iter()
            .fold(
                Binding::new(
                    topology.queue_name("notification"),
                    topology.notification_exchange(),
                ),
                |binding, kind| binding.key(topology.routing_key(kind)),
            );
        subscriptions.push(
            bus.subscribe(
                notifications,
                Arc::new(NotificationWorker::new(subject.clone(), notifier.clone())),
            )
            .await?,
        );

        let jobs = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(jobs.clone(), clock.clone());
        executor.register_handler(
            "refresh.*",
            Arc::new(RefreshTrigger::new(state, publisher)),
        );
        let executor = executor.spawn(JobExecutorConfig::default().with_name("refresh-jobs"));

        let mut scheduler = Scheduler::new(jobs, clock.clone());
        scheduler.add(self.schedule()?);
        let scheduler_cancel = CancellationToken::new();
        let scheduler = scheduler.spawn(SCHEDULER_POLL, scheduler_cancel.clone());

        info!(%subject, queues = subscriptions.len(), "refresh worker running");
        Ok(RunningApp {
            bus: bus.clone(),
            subscriptions,
            executor,
            scheduler,
            scheduler_cancel,
        })
    }
}

impl core::fmt::Debug for App {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("App")
            .field("subject", &self.settings.refresh.subject)
            .finish_non_exhaustive()
    }
}

/// A started worker.
pub struct RunningApp {
    bus: Arc<dyn MessageBus>,
    subscriptions: Vec<SubscriptionHandle>,
    executor: JobExecutorHandle,
    scheduler: JoinHandle<()>,
    scheduler_cancel: CancellationToken,
}

impl RunningApp {
    /// Stop scheduling, finish in-flight jobs and deliveries, then close the
    /// bus.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.scheduler_cancel.cancel();
        if let Err(e) = self.scheduler.await {
            warn!(error = %e, "scheduler task ended abnormally");
        }
        self.executor.shutdown().await;

        for handle in &self.subscriptions {
            if let Err(e) = self.bus.unsubscribe(handle).await {
                warn!(queue = %handle.queue, error = %e, "unsubscribe failed");
            }
        }
        self.bus.close().await.context("closing message bus")?;
        info!("refresh worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use refsync_converter::TabularResponse;
    use refsync_core::ManualClock;
    use refsync_events::{
        Delivery, HEADER_DEATH_REASON, HandlerOutcome, MessageHandler, RefreshMessage,
    };
    use refsync_infra::source::{SourceError, StaticSource};
    use refsync_refresh::RefreshStatus;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct DownSource;

    #[async_trait]
    impl MarketDataSource for DownSource {
        async fn fetch_page(
            &self,
            _start: usize,
            _limit: usize,
        ) -> Result<TabularResponse, SourceError> {
            Err(SourceError::Unavailable("connection refused".into()))
        }
    }

    struct Collect(mpsc::UnboundedSender<Delivery>);

    #[async_trait]
    impl MessageHandler for Collect {
        async fn handle(&self, delivery: &Delivery, _cancel: &CancellationToken) -> HandlerOutcome {
            let _ = self.0.send(delivery.clone());
            HandlerOutcome::Ack
        }
    }

    fn settings(extra: &[(&str, &str)]) -> Settings {
        let vars: HashMap<String, String> = [
            ("BROKER_HOST", "localhost"),
            ("BROKER_USER", "guest"),
            ("BROKER_PASSWORD", "guest"),
            ("STORE_HOST", "localhost"),
            ("STORE_TIMEOUT_MS", "500"),
            ("REFRESH_EXPIRY_SECS", "900"),
            ("JOB_MAX_RETRY_COUNT", "2"),
            ("JOB_DELAY_SECS", "3600"),
            ("PROVIDER_URL", "http://provider.test/iss"),
        ]
        .iter()
        .chain(extra)
        .map(|(k, v)| (format!("REFSYNC_{k}"), v.to_string()))
        .collect();
        Settings::from_lookup(|k| vars.get(k).cloned()).unwrap()
    }

    fn listing(rows: usize) -> TabularResponse {
        let document = json!({
            "securities": {
                "columns": ["secid"],
                "metadata": {"secid": {"type": "string"}},
                "data": (0..rows).map(|i| json!([format!("SEC{i}")])).collect::<Vec<_>>(),
            }
        });
        TabularResponse::from_json_block(&document, "securities").unwrap()
    }

    #[test]
    fn cron_overrides_interval() {
        let app = App::in_memory(
            settings(&[("JOB_CRON", "0 0 3 * * *")]),
            ManualClock::starting_now(),
            Arc::new(StaticSource::default()),
        );
        assert!(matches!(app.schedule().unwrap().cadence, Cadence::Cron(_)));

        let app = App::in_memory(
            settings(&[]),
            ManualClock::starting_now(),
            Arc::new(StaticSource::default()),
        );
        let schedule = app.schedule().unwrap();
        assert!(matches!(schedule.cadence, Cadence::Interval(d) if d == Duration::from_secs(3600)));
        assert_eq!(schedule.retry_policy.max_attempts, 3);
    }

    #[tokio::test]
    async fn startup_run_completes_and_shuts_down_cleanly() {
        let clock: SharedClock = SystemClock::shared();
        let app = App::in_memory(
            settings(&[("PROVIDER_PAGE_SIZE", "25")]),
            clock.clone(),
            Arc::new(StaticSource::new(listing(60))),
        );
        let progress = app.components.progress.clone();
        let running = app.start().await.unwrap();

        let state = RefreshStateMachine::new(
            refsync_core::Subject::new("securities").unwrap(),
            progress,
            clock,
            Duration::from_secs(900),
        );
        let done = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(p) = state.try_get_active().await.unwrap() {
                    if p.status() == RefreshStatus::Completed {
                        return p;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("run did not complete");
        assert_eq!(done.saved_count(), 60);

        running.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_request_is_kept_on_the_dead_letter_queue() {
        let clock: SharedClock = SystemClock::shared();
        let app = App::in_memory(
            settings(&[("BROKER_MAX_REDELIVERY", "0")]),
            clock.clone(),
            Arc::new(DownSource),
        );
        let bus = app.components.bus.clone();
        let progress = app.components.progress.clone();
        let dead_letters = app.topology().dead_letter_binding();
        let running = app.start().await.unwrap();

        let state = RefreshStateMachine::new(
            refsync_core::Subject::new("securities").unwrap(),
            progress,
            clock,
            Duration::from_secs(900),
        );
        let failed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(p) = state.try_get_active().await.unwrap() {
                    if p.status() == RefreshStatus::Failed {
                        return p;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("run did not fail");

        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(dead_letters, Arc::new(Collect(tx))).await.unwrap();
        let parked = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("nothing on the dead-letter queue")
            .unwrap();
        assert!(matches!(
            parked.envelope.message(),
            RefreshMessage::Refresh { operation_id } if operation_id == failed.correlation_id()
        ));
        assert!(parked.envelope.header(HEADER_DEATH_REASON).is_some());

        running.shutdown().await.unwrap();
    }
}
