//! Refresh messages and the message bus they travel on.
//!
//! - `message`: the closed set of refresh contracts
//! - `envelope`: identity, timing and headers around a message
//! - `topology`: exchanges, routing keys and bindings
//! - `bus`: the broker abstraction and handler contract
//! - `in_memory_bus`: in-process broker for tests/dev

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;
pub mod message;
pub mod topology;

pub use bus::{
    BusError, BusOptions, Delivery, EventPublisher, HandlerOutcome, MessageBus, MessageHandler,
    SubscriptionHandle,
};
pub use envelope::{
    Envelope, HEADER_CAUSATION_ID, HEADER_CORRELATION_ID, HEADER_DEATH_REASON,
    HEADER_ORIGINAL_EXCHANGE, HEADER_REDELIVERY_COUNT, HEADER_TRACEPARENT, Headers,
};
pub use in_memory_bus::InMemoryBroker;
pub use message::{MessageKind, RefreshMessage};
pub use topology::{Binding, Topology, topic_matches};
