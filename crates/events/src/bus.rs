//! Message bus abstraction (mechanics only).
//!
//! Publish/subscribe over a topic-exchange broker. The bus owns delivery,
//! acknowledgement, redelivery and dead-lettering; handlers only decide the
//! outcome of a single delivery.
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: a delivery that is not acknowledged (handler failure,
//!   cancellation, lost connection) is delivered again. Handlers must be
//!   idempotent, keyed by `message_id` or correlation id.
//! - **Bounded redelivery**: a delivery that keeps failing is retried up to
//!   `max_redeliveries` times, then routed to the dead-letter exchange and
//!   never processed again by the original queue.
//! - **Backpressure**: at most `prefetch` unacknowledged deliveries are in
//!   flight per consumer. A slow handler throttles delivery instead of
//!   queueing unbounded work in memory.
//! - **No ordering** between unrelated runs.
//!
//! ## Handler contract
//!
//! ```text
//! Ack            -> removed from the queue
//! Retry(reason)  -> redelivered (redelivery_count + 1), dead-lettered once
//!                   redelivery_count == max_redeliveries
//! Reject(reason) -> dead-lettered immediately (payload can never succeed)
//! cancelled      -> returned to the queue, not counted as a failure
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::envelope::Envelope;
use crate::topology::{Binding, Topology};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker channel error: {0}")]
    Channel(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown exchange: {0}")]
    UnknownExchange(String),

    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),

    #[error("broker refused to confirm publish: {0}")]
    Nacked(String),

    #[error("no queue bound for {routing_key} on {exchange}")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    #[error("bus is closed")]
    Closed,
}

impl BusError {
    /// Failures that a reconnect or a later attempt can fix.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::Connection(_) | BusError::Channel(_) | BusError::Nacked(_)
        )
    }
}

/// Consumer-side policy shared by every subscription of a bus.
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Maximum unacknowledged deliveries per consumer.
    pub prefetch: u16,
    /// Redeliveries after the first attempt before dead-lettering.
    pub max_redeliveries: u32,
    /// Delay before a failed delivery becomes visible again.
    pub redelivery_delay: Duration,
    /// Destination for messages that exhaust their redeliveries.
    pub dead_letter_exchange: Option<String>,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            prefetch: 16,
            max_redeliveries: 5,
            redelivery_delay: Duration::from_millis(200),
            dead_letter_exchange: None,
        }
    }
}

impl BusOptions {
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_max_redeliveries(mut self, max: u32) -> Self {
        self.max_redeliveries = max;
        self
    }

    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

/// One delivery of an envelope to a handler.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    pub exchange: String,
    pub routing_key: String,
    /// How many times this message was delivered before (0 on first delivery).
    pub redelivery_count: u32,
    pub max_redeliveries: u32,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.redelivery_count > 0
    }

    /// A `Retry` outcome on this delivery dead-letters the message.
    pub fn is_final_attempt(&self) -> bool {
        self.redelivery_count >= self.max_redeliveries
    }
}

/// Outcome a handler signals exactly once per delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Ack,
    Retry(String),
    Reject(String),
}

impl HandlerOutcome {
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry(reason.into())
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject(reason.into())
    }
}

/// Processes deliveries from one queue.
///
/// `cancel` fires when the subscription is torn down mid-delivery. A handler
/// observing it must return promptly without side effects; whatever it
/// returns, the delivery goes back to the queue.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: &Delivery, cancel: &CancellationToken) -> HandlerOutcome;
}

/// Identifies an active subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub consumer_tag: String,
    pub queue: String,
}

/// Topic-exchange message bus.
///
/// Implementations are shared across publishers and subscribers within a
/// process (`Send + Sync`); connection lifecycle is internal.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Declare a topic exchange (idempotent).
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BusError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), BusError>;

    /// Declare the binding's durable queue and bind it without consuming.
    /// Messages routed to it wait until someone subscribes.
    async fn declare_queue(&self, binding: &Binding) -> Result<(), BusError>;

    /// Declare the binding's durable queue, bind it and start consuming.
    async fn subscribe(
        &self,
        binding: Binding,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, BusError>;

    /// Stop consuming. In-flight deliveries are cancelled and returned to the
    /// queue.
    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), BusError>;

    /// Stop all consumers, let in-flight deliveries finish, then release the
    /// connection. Further publishes fail with [`BusError::Closed`].
    async fn close(&self) -> Result<(), BusError>;
}

#[async_trait]
impl<B> MessageBus for Arc<B>
where
    B: MessageBus + ?Sized,
{
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BusError> {
        (**self).declare_exchange(exchange).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), BusError> {
        (**self).publish(exchange, routing_key, envelope).await
    }

    async fn declare_queue(&self, binding: &Binding) -> Result<(), BusError> {
        (**self).declare_queue(binding).await
    }

    async fn subscribe(
        &self,
        binding: Binding,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, BusError> {
        (**self).subscribe(binding, handler).await
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), BusError> {
        (**self).unsubscribe(handle).await
    }

    async fn close(&self) -> Result<(), BusError> {
        (**self).close().await
    }
}

/// Publishes envelopes to the exchange and routing key the topology assigns
/// to their kind.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<dyn MessageBus>,
    topology: Topology,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn MessageBus>, topology: Topology) -> Self {
        Self { bus, topology }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Declare every exchange of the topology.
    pub async fn declare_topology(&self) -> Result<(), BusError> {
        for exchange in self.topology.exchanges() {
            self.bus.declare_exchange(exchange).await?;
        }
        Ok(())
    }

    #[instrument(
        skip(self, envelope),
        fields(
            message_id = %envelope.message_id(),
            message_type = envelope.message_type(),
            operation_id = %envelope.operation_id()
        ),
        err
    )]
    pub async fn publish(&self, envelope: &Envelope) -> Result<(), BusError> {
        let kind = envelope.kind();
        let exchange = self.topology.exchange_for(kind);
        let routing_key = self.topology.routing_key(kind);
        self.bus.publish(exchange, &routing_key, envelope).await
    }
}

impl core::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("topology", &self.topology)
            .finish_non_exhaustive()
    }
}
