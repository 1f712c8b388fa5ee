//! In-memory topic broker for tests/dev.
//!
//! Mirrors the broker semantics the pipeline relies on: topic exchanges,
//! durable queues that buffer until consumed, per-consumer prefetch,
//! redelivery counting and a dead-letter exchange. Payloads travel encoded so
//! the JSON wire format is exercised end to end.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::bus::{
    BusError, BusOptions, Delivery, HandlerOutcome, MessageBus, MessageHandler, SubscriptionHandle,
};
use crate::envelope::{
    Envelope, HEADER_DEATH_REASON, HEADER_ORIGINAL_EXCHANGE, HEADER_REDELIVERY_COUNT,
};
use crate::topology::{Binding, topic_matches};

#[derive(Debug, Clone)]
struct Queued {
    payload: Vec<u8>,
    exchange: String,
    routing_key: String,
    redelivery_count: u32,
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Queued>>>;

struct QueueState {
    tx: mpsc::UnboundedSender<Queued>,
    rx: SharedReceiver,
}

#[derive(Default)]
struct ExchangeState {
    /// (routing pattern, queue)
    bindings: Vec<(String, String)>,
}

struct ConsumerState {
    /// Stops pulling new deliveries.
    stop: CancellationToken,
    /// Cancels in-flight handlers.
    cancel: CancellationToken,
    tasks: TaskTracker,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    consumers: HashMap<String, ConsumerState>,
    closed: bool,
}

struct Inner {
    options: BusOptions,
    state: Mutex<BrokerState>,
    next_tag: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Fan a payload out to every queue bound to `exchange` by `routing_key`.
    fn route(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<usize, BusError> {
        let state = self.lock();
        let ex = state
            .exchanges
            .get(exchange)
            .ok_or_else(|| BusError::UnknownExchange(exchange.to_string()))?;

        let mut targets = HashSet::new();
        for (pattern, queue) in &ex.bindings {
            if topic_matches(pattern, routing_key) {
                targets.insert(queue.as_str());
            }
        }

        let mut routed = 0;
        for queue in targets {
            if let Some(q) = state.queues.get(queue) {
                let queued = Queued {
                    payload: payload.clone(),
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    redelivery_count: 0,
                };
                if q.tx.send(queued).is_ok() {
                    routed += 1;
                }
            }
        }

        if routed == 0 {
            debug!(exchange, routing_key, "message unroutable, dropped");
        }
        Ok(routed)
    }

    /// Create the binding's queue if needed and bind its routing keys.
    fn bind(
        state: &mut BrokerState,
        binding: &Binding,
    ) -> Result<(SharedReceiver, mpsc::UnboundedSender<Queued>), BusError> {
        let exchange = state
            .exchanges
            .get_mut(&binding.exchange)
            .ok_or_else(|| BusError::UnknownExchange(binding.exchange.clone()))?;
        for key in &binding.routing_keys {
            let entry = (key.clone(), binding.queue.clone());
            if !exchange.bindings.contains(&entry) {
                exchange.bindings.push(entry);
            }
        }

        let queue = state
            .queues
            .entry(binding.queue.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                QueueState {
                    tx,
                    rx: Arc::new(tokio::sync::Mutex::new(rx)),
                }
            });
        Ok((queue.rx.clone(), queue.tx.clone()))
    }

    fn dead_letter(&self, queued: Queued, reason: &str) {
        let Some(dlx) = self.options.dead_letter_exchange.as_deref() else {
            warn!(
                routing_key = %queued.routing_key,
                reason,
                "no dead-letter exchange configured, dropping message"
            );
            return;
        };

        let payload = match Envelope::decode(&queued.payload) {
            Ok(mut envelope) => {
                envelope.set_header(HEADER_DEATH_REASON, reason);
                envelope.set_header(HEADER_ORIGINAL_EXCHANGE, queued.exchange.as_str());
                envelope.set_header(
                    HEADER_REDELIVERY_COUNT,
                    JsonValue::from(queued.redelivery_count),
                );
                envelope.encode().unwrap_or(queued.payload)
            }
            Err(_) => queued.payload,
        };

        match self.route(dlx, &queued.routing_key, payload) {
            Ok(_) => warn!(
                routing_key = %queued.routing_key,
                redelivery_count = queued.redelivery_count,
                reason,
                "message sent to dead-letter exchange"
            ),
            Err(e) => warn!(error = %e, "failed to dead-letter message"),
        }
    }
}

/// In-memory topic broker.
///
/// Cheap to clone; clones share the same exchanges and queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new(options: BusOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                state: Mutex::new(BrokerState::default()),
                next_tag: AtomicU64::new(1),
            }),
        }
    }

    pub fn options(&self) -> &BusOptions {
        &self.inner.options
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(BusOptions::default())
    }
}

impl core::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MessageBus for InMemoryBroker {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BusError> {
        let mut state = self.inner.lock();
        state.exchanges.entry(exchange.to_string()).or_default();
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), BusError> {
        if self.inner.lock().closed {
            return Err(BusError::Closed);
        }
        let payload = envelope
            .encode()
            .map_err(|e| BusError::Serialization(e.to_string()))?;
        self.inner.route(exchange, routing_key, payload)?;
        Ok(())
    }

    async fn declare_queue(&self, binding: &Binding) -> Result<(), BusError> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(BusError::Closed);
        }
        Inner::bind(&mut state, binding)?;
        debug!(queue = %binding.queue, exchange = %binding.exchange, "queue declared");
        Ok(())
    }

    async fn subscribe(
        &self,
        binding: Binding,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, BusError> {
        let tag = format!(
            "ctag-{}",
            self.inner.next_tag.fetch_add(1, Ordering::Relaxed)
        );

        let (rx, requeue, stop, cancel, tasks) = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(BusError::Closed);
            }

            let (rx, requeue) = Inner::bind(&mut state, &binding)?;

            let consumer = ConsumerState {
                stop: CancellationToken::new(),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
            };
            let handles = (
                rx,
                requeue,
                consumer.stop.clone(),
                consumer.cancel.clone(),
                consumer.tasks.clone(),
            );
            state.consumers.insert(tag.clone(), consumer);
            handles
        };

        let consumer = Consumer {
            inner: self.inner.clone(),
            rx,
            requeue,
            handler,
            stop,
            cancel,
            tasks: tasks.clone(),
        };
        tasks.spawn(consumer.run());

        debug!(consumer_tag = %tag, queue = %binding.queue, "subscribed");
        Ok(SubscriptionHandle {
            consumer_tag: tag,
            queue: binding.queue,
        })
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), BusError> {
        let consumer = self
            .inner
            .lock()
            .consumers
            .remove(&handle.consumer_tag)
            .ok_or_else(|| BusError::UnknownSubscription(handle.consumer_tag.clone()))?;

        consumer.stop.cancel();
        consumer.cancel.cancel();
        consumer.tasks.close();
        consumer.tasks.wait().await;
        debug!(consumer_tag = %handle.consumer_tag, "unsubscribed");
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        let consumers: Vec<ConsumerState> = {
            let mut state = self.inner.lock();
            state.consumers.drain().map(|(_, c)| c).collect()
        };

        for consumer in &consumers {
            consumer.stop.cancel();
            consumer.tasks.close();
        }
        for consumer in &consumers {
            consumer.tasks.wait().await;
        }

        self.inner.lock().closed = true;
        Ok(())
    }
}

struct Consumer {
    inner: Arc<Inner>,
    rx: SharedReceiver,
    requeue: mpsc::UnboundedSender<Queued>,
    handler: Arc<dyn MessageHandler>,
    stop: CancellationToken,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Consumer {
    async fn run(self) {
        let permits = Arc::new(Semaphore::new(usize::from(self.inner.options.prefetch.max(1))));

        loop {
            let permit = tokio::select! {
                _ = self.stop.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                _ = self.stop.cancelled() => break,
                next = async { self.rx.lock().await.recv().await } => next,
            };
            let Some(queued) = next else { break };

            self.tasks.spawn(deliver(
                self.inner.clone(),
                self.requeue.clone(),
                queued,
                self.handler.clone(),
                self.cancel.clone(),
                permit,
            ));
        }
    }
}

async fn deliver(
    inner: Arc<Inner>,
    requeue: mpsc::UnboundedSender<Queued>,
    queued: Queued,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    let envelope = match Envelope::decode(&queued.payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            inner.dead_letter(queued, &format!("undecodable payload: {e}"));
            return;
        }
    };

    let delivery = Delivery {
        envelope,
        exchange: queued.exchange.clone(),
        routing_key: queued.routing_key.clone(),
        redelivery_count: queued.redelivery_count,
        max_redeliveries: inner.options.max_redeliveries,
    };

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        outcome = handler.handle(&delivery, &cancel) => Some(outcome),
    };

    match outcome {
        None => {
            debug!(message_id = %delivery.envelope.message_id(), "delivery cancelled, requeued");
            let _ = requeue.send(queued);
        }
        Some(HandlerOutcome::Ack) => {}
        Some(HandlerOutcome::Retry(reason)) => {
            if queued.redelivery_count < inner.options.max_redeliveries {
                debug!(
                    message_id = %delivery.envelope.message_id(),
                    redelivery_count = queued.redelivery_count,
                    %reason,
                    "delivery failed, scheduling redelivery"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(inner.options.redelivery_delay) => {}
                }
                let _ = requeue.send(Queued {
                    redelivery_count: queued.redelivery_count + 1,
                    ..queued
                });
            } else {
                inner.dead_letter(queued, &reason);
            }
        }
        Some(HandlerOutcome::Reject(reason)) => inner.dead_letter(queued, &reason),
    }
}
