//! AMQP 0-9-1 message bus (RabbitMQ) built on `lapin`.
//!
//! - one lazily opened connection, reopened with backoff when lost
//! - topic exchanges and durable queues; queues carry
//!   `x-dead-letter-exchange` so broker-side rejects land in the DLX too
//! - `basic_qos(prefetch)` per consumer channel
//! - redelivery is explicit: a retried delivery is republished to its queue
//!   with `x-redelivery-count + 1` and the original acknowledged, so the count
//!   survives process restarts
//! - exhausted or rejected deliveries are published to the dead-letter
//!   exchange under their original routing key
//! - the publisher channel runs in confirm mode; redeliveries and dead
//!   letters are published `mandatory`, and the original delivery is acked
//!   only after the broker confirmed the follow-up and routed it to a queue

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery as AmqpDelivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use refsync_events::{
    Binding, BusError, BusOptions, Delivery, Envelope, HEADER_DEATH_REASON,
    HEADER_ORIGINAL_EXCHANGE, HEADER_REDELIVERY_COUNT, HandlerOutcome, MessageBus, MessageHandler,
    SubscriptionHandle,
};

use crate::jobs::RetryPolicy;

const HEADER_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";

fn connection_error(e: lapin::Error) -> BusError {
    BusError::Connection(e.to_string())
}

fn channel_error(e: lapin::Error) -> BusError {
    match e {
        lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
            BusError::Connection(e.to_string())
        }
        other => BusError::Channel(other.to_string()),
    }
}

fn header_u32(headers: &FieldTable, key: &str) -> Option<u32> {
    match headers.inner().get(key)? {
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        _ => None,
    }
}

fn header_str(headers: &FieldTable, key: &str) -> Option<String> {
    match headers.inner().get(key)? {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.as_str().to_string()),
        _ => None,
    }
}

/// Turn the broker's answer to a confirmed publish into a result.
fn confirmed(confirmation: Confirmation, exchange: &str, routing_key: &str) -> Result<(), BusError> {
    match confirmation {
        Confirmation::Ack(None) => Ok(()),
        // A mandatory publish that matched no queue comes back before the ack.
        Confirmation::Ack(Some(_)) | Confirmation::Nack(Some(_)) => Err(BusError::Unroutable {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        }),
        Confirmation::Nack(None) => Err(BusError::Nacked(format!("{exchange}/{routing_key}"))),
        Confirmation::NotRequested => Err(BusError::Channel(
            "publisher channel is not in confirm mode".to_string(),
        )),
    }
}

fn properties(envelope: &Envelope, headers: FieldTable) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(ShortString::from("application/json"))
        .with_delivery_mode(2)
        .with_message_id(ShortString::from(envelope.message_id().to_string()))
        .with_correlation_id(ShortString::from(envelope.correlation_id().to_string()))
        .with_headers(headers)
}

struct ConsumerState {
    stop: CancellationToken,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

struct Inner {
    uri: String,
    options: BusOptions,
    reconnect: RetryPolicy,
    connection: Mutex<Option<Arc<Connection>>>,
    publisher: Mutex<Option<Channel>>,
    consumers: StdMutex<HashMap<String, ConsumerState>>,
    next_tag: AtomicU64,
    closed: AtomicBool,
}

/// RabbitMQ-backed [`MessageBus`].
#[derive(Clone)]
pub struct AmqpMessageBus {
    inner: Arc<Inner>,
}

impl AmqpMessageBus {
    /// Create the bus; nothing is opened until first use.
    pub fn new(uri: impl Into<String>, options: BusOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                uri: uri.into(),
                options,
                reconnect: RetryPolicy::exponential(
                    8,
                    std::time::Duration::from_millis(200),
                    std::time::Duration::from_secs(30),
                ),
                connection: Mutex::new(None),
                publisher: Mutex::new(None),
                consumers: StdMutex::new(HashMap::new()),
                next_tag: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.reconnect = policy;
        }
        self
    }

    fn consumers(&self) -> std::sync::MutexGuard<'_, HashMap<String, ConsumerState>> {
        self.inner
            .consumers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }
}

impl core::fmt::Debug for AmqpMessageBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AmqpMessageBus")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    /// Shared connection, (re)opened with backoff.
    async fn connection(&self) -> Result<Arc<Connection>, BusError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            if conn.status().connected() {
                return Ok(conn.clone());
            }
            warn!("amqp connection lost, reconnecting");
        }

        let mut attempt = 0;
        let conn = loop {
            attempt += 1;
            match Connection::connect(&self.uri, ConnectionProperties::default()).await {
                Ok(conn) => break Arc::new(conn),
                Err(e) if self.reconnect.should_retry(attempt) => {
                    let delay = self.reconnect.delay_for_attempt(attempt);
                    warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "amqp connect failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(connection_error(e)),
            }
        };

        info!("amqp connection established");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn open_channel(&self) -> Result<Channel, BusError> {
        self.connection()
            .await?
            .create_channel()
            .await
            .map_err(channel_error)
    }

    async fn publisher(&self) -> Result<Channel, BusError> {
        let mut slot = self.publisher.lock().await;
        if let Some(channel) = slot.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }
        let channel = self.open_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(channel_error)?;
        *slot = Some(channel.clone());
        Ok(channel)
    }

    async fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
        headers: FieldTable,
        mandatory: bool,
    ) -> Result<(), BusError> {
        let payload = envelope
            .encode()
            .map_err(|e| BusError::Serialization(e.to_string()))?;
        let channel = self.publisher().await?;
        let confirmation = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    ..Default::default()
                },
                &payload,
                properties(envelope, headers),
            )
            .await
            .map_err(channel_error)?
            .await
            .map_err(channel_error)?;
        confirmed(confirmation, exchange, routing_key)
    }

    async fn declare_queue(&self, channel: &Channel, binding: &Binding) -> Result<(), BusError> {
        let mut args = FieldTable::default();
        // Parking queues on the DLX itself must not loop back into it.
        let dlx = self
            .options
            .dead_letter_exchange
            .as_deref()
            .filter(|dlx| *dlx != binding.exchange);
        if let Some(dlx) = dlx {
            args.insert(
                ShortString::from("x-dead-letter-exchange"),
                AMQPValue::LongString(LongString::from(dlx)),
            );
        }

        channel
            .queue_declare(
                &binding.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(channel_error)?;

        for key in &binding.routing_keys {
            channel
                .queue_bind(
                    &binding.queue,
                    &binding.exchange,
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(channel_error)?;
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BusError> {
        let Some(dlx) = self.options.dead_letter_exchange.as_deref() else {
            warn!(routing_key = %delivery.routing_key, reason, "no dead-letter exchange configured, dropping message");
            return Ok(());
        };

        let envelope = delivery
            .envelope
            .clone()
            .with_header(HEADER_DEATH_REASON, reason)
            .with_header(HEADER_ORIGINAL_EXCHANGE, delivery.exchange.as_str())
            .with_header(
                HEADER_REDELIVERY_COUNT,
                JsonValue::from(delivery.redelivery_count),
            );
        self.publish_raw(dlx, &delivery.routing_key, &envelope, FieldTable::default(), true)
            .await?;
        warn!(
            routing_key = %delivery.routing_key,
            redelivery_count = delivery.redelivery_count,
            reason,
            "message sent to dead-letter exchange"
        );
        Ok(())
    }

    async fn redeliver(&self, queue: &str, delivery: &Delivery) -> Result<(), BusError> {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(HEADER_REDELIVERY_COUNT),
            AMQPValue::LongUInt(delivery.redelivery_count + 1),
        );
        headers.insert(
            ShortString::from(HEADER_ORIGINAL_EXCHANGE),
            AMQPValue::LongString(LongString::from(delivery.exchange.as_str())),
        );
        headers.insert(
            ShortString::from(HEADER_ORIGINAL_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(delivery.routing_key.as_str())),
        );
        // Default exchange routes by queue name.
        self.publish_raw("", queue, &delivery.envelope, headers, true)
            .await
    }
}

#[async_trait]
impl MessageBus for AmqpMessageBus {
    #[instrument(skip(self), err)]
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BusError> {
        self.inner.ensure_open()?;
        let channel = self.inner.publisher().await?;
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), BusError> {
        self.inner.ensure_open()?;
        self.inner
            .publish_raw(exchange, routing_key, envelope, FieldTable::default(), false)
            .await
    }

    #[instrument(skip(self, binding), fields(queue = %binding.queue), err)]
    async fn declare_queue(&self, binding: &Binding) -> Result<(), BusError> {
        self.inner.ensure_open()?;
        let channel = self.inner.publisher().await?;
        self.inner.declare_queue(&channel, binding).await
    }

    #[instrument(skip(self, binding, handler), fields(queue = %binding.queue), err)]
    async fn subscribe(
        &self,
        binding: Binding,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, BusError> {
        self.inner.ensure_open()?;

        // Declare eagerly so configuration errors surface to the caller.
        let channel = self.inner.open_channel().await?;
        self.inner.declare_queue(&channel, &binding).await?;

        let tag = format!(
            "refsync-{}-{}",
            binding.queue,
            self.inner.next_tag.fetch_add(1, Ordering::Relaxed)
        );
        let state = ConsumerState {
            stop: CancellationToken::new(),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };

        let consumer = Consumer {
            inner: self.inner.clone(),
            binding: binding.clone(),
            tag: tag.clone(),
            handler,
            stop: state.stop.clone(),
            cancel: state.cancel.clone(),
            tasks: state.tasks.clone(),
        };
        state.tasks.spawn(consumer.run(Some(channel)));
        self.consumers().insert(tag.clone(), state);

        Ok(SubscriptionHandle {
            consumer_tag: tag,
            queue: binding.queue,
        })
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), BusError> {
        let state = self
            .consumers()
            .remove(&handle.consumer_tag)
            .ok_or_else(|| BusError::UnknownSubscription(handle.consumer_tag.clone()))?;
        state.stop.cancel();
        state.cancel.cancel();
        state.tasks.close();
        state.tasks.wait().await;
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        let consumers: Vec<ConsumerState> = self.consumers().drain().map(|(_, c)| c).collect();
        for consumer in &consumers {
            consumer.stop.cancel();
            consumer.tasks.close();
        }
        for consumer in &consumers {
            consumer.tasks.wait().await;
        }

        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.publisher.lock().await.take();
        if let Some(conn) = self.inner.connection.lock().await.take() {
            if conn.status().connected() {
                conn.close(200, "closing").await.map_err(connection_error)?;
            }
        }
        info!("amqp bus closed");
        Ok(())
    }
}

struct Consumer {
    inner: Arc<Inner>,
    binding: Binding,
    tag: String,
    handler: Arc<dyn MessageHandler>,
    stop: CancellationToken,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Consumer {
    async fn run(self, mut first: Option<Channel>) {
        let mut failures = 0;
        while !self.stop.is_cancelled() {
            let channel = match first.take() {
                Some(channel) => Ok(channel),
                None => self.inner.open_channel().await,
            };

            match channel {
                Ok(channel) => match self.consume(&channel).await {
                    Ok(()) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        warn!(queue = %self.binding.queue, error = %e, "consumer failed");
                    }
                },
                Err(e) => {
                    failures += 1;
                    warn!(queue = %self.binding.queue, error = %e, "consumer channel unavailable");
                }
            }

            if self.stop.is_cancelled() {
                break;
            }
            let delay = self.inner.reconnect.delay_for_attempt(failures.max(1));
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(consumer_tag = %self.tag, "consumer stopped");
    }

    /// Consume until the stream ends or `stop` fires.
    async fn consume(&self, channel: &Channel) -> Result<(), BusError> {
        self.inner.declare_queue(channel, &self.binding).await?;
        channel
            .basic_qos(self.inner.options.prefetch.max(1), BasicQosOptions::default())
            .await
            .map_err(channel_error)?;
        let mut stream = channel
            .basic_consume(
                &self.binding.queue,
                &self.tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;
        info!(queue = %self.binding.queue, consumer_tag = %self.tag, "consuming");

        loop {
            let next = tokio::select! {
                _ = self.stop.cancelled() => {
                    let _ = channel.basic_cancel(&self.tag, BasicCancelOptions::default()).await;
                    return Ok(());
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.tasks.spawn(handle_delivery(
                        self.inner.clone(),
                        self.binding.queue.clone(),
                        delivery,
                        self.handler.clone(),
                        self.cancel.clone(),
                    ));
                }
                Some(Err(e)) => return Err(channel_error(e)),
                None => return Err(BusError::Channel("consumer stream ended".to_string())),
            }
        }
    }
}

async fn handle_delivery(
    inner: Arc<Inner>,
    queue: String,
    raw: AmqpDelivery,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
) {
    let empty = FieldTable::default();
    let headers = raw.properties.headers().as_ref().unwrap_or(&empty);

    let envelope = match Envelope::decode(&raw.data) {
        Ok(envelope) => envelope,
        Err(e) => {
            // Broker dead-letters via the queue's x-dead-letter-exchange.
            warn!(error = %e, "undecodable payload, rejecting");
            let _ = raw
                .acker
                .nack(BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                })
                .await;
            return;
        }
    };

    let delivery = Delivery {
        envelope,
        exchange: header_str(headers, HEADER_ORIGINAL_EXCHANGE)
            .unwrap_or_else(|| raw.exchange.as_str().to_string()),
        routing_key: header_str(headers, HEADER_ORIGINAL_ROUTING_KEY)
            .unwrap_or_else(|| raw.routing_key.as_str().to_string()),
        redelivery_count: header_u32(headers, HEADER_REDELIVERY_COUNT).unwrap_or(0),
        max_redeliveries: inner.options.max_redeliveries,
    };

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        outcome = handler.handle(&delivery, &cancel) => Some(outcome),
    };

    let settled = match outcome {
        None => raw
            .acker
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await
            .map_err(channel_error),
        Some(HandlerOutcome::Ack) => raw
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(channel_error),
        Some(HandlerOutcome::Retry(reason))
            if delivery.redelivery_count < inner.options.max_redeliveries =>
        {
            debug!(redelivery_count = delivery.redelivery_count, %reason, "scheduling redelivery");
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(inner.options.redelivery_delay) => {}
            }
            settle_after(inner.redeliver(&queue, &delivery).await, raw).await
        }
        Some(HandlerOutcome::Retry(reason)) | Some(HandlerOutcome::Reject(reason)) => {
            settle_after(inner.dead_letter(&delivery, &reason).await, raw).await
        }
    };

    if let Err(e) = settled {
        error!(message_id = %delivery.envelope.message_id(), error = %e, "failed to settle delivery");
    }
}

/// Ack once the follow-up publish succeeded, otherwise requeue the original.
async fn settle_after(published: Result<(), BusError>, raw: AmqpDelivery) -> Result<(), BusError> {
    match published {
        Ok(()) => raw
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(channel_error),
        Err(e) => {
            let _ = raw
                .acker
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await;
            Err(e)
        }
    }
}
