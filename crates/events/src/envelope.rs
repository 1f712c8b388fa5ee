use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use refsync_core::{CorrelationId, MessageId};

use crate::message::{MessageKind, RefreshMessage};

/// Free-form header map carried by every envelope.
pub type Headers = BTreeMap<String, JsonValue>;

/// Header carrying the run's correlation id across hops.
pub const HEADER_CORRELATION_ID: &str = "correlation_id";
/// Header naming the message that caused this one.
pub const HEADER_CAUSATION_ID: &str = "causation_id";
/// W3C trace context, propagated verbatim.
pub const HEADER_TRACEPARENT: &str = "traceparent";
/// Bus-maintained redelivery counter.
pub const HEADER_REDELIVERY_COUNT: &str = "x-redelivery-count";
/// Set by the bus when a message is dead-lettered.
pub const HEADER_DEATH_REASON: &str = "x-death-reason";
/// Exchange a dead-lettered message was originally published to.
pub const HEADER_ORIGINAL_EXCHANGE: &str = "x-original-exchange";

/// Envelope for a refresh message, the unit handed to the bus.
///
/// Notes:
/// - `message_id` is the idempotency key for handlers.
/// - `finished_at` is set for terminal messages; `duration()` is derived from it.
/// - `headers` propagate correlation and tracing context; keys starting with
///   `x-` belong to the bus and are not copied to follow-up messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    message_id: MessageId,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    headers: Headers,
    #[serde(flatten)]
    message: RefreshMessage,
}

impl Envelope {
    pub fn new(message: RefreshMessage, created_at: DateTime<Utc>) -> Self {
        let mut headers = Headers::new();
        headers.insert(
            HEADER_CORRELATION_ID.to_string(),
            JsonValue::String(message.operation_id().to_string()),
        );
        Self {
            message_id: MessageId::new(),
            created_at,
            finished_at: None,
            headers,
            message,
        }
    }

    pub fn refresh(operation_id: CorrelationId, at: DateTime<Utc>) -> Self {
        Self::new(RefreshMessage::Refresh { operation_id }, at)
    }

    pub fn start(operation_id: CorrelationId, details: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::new(
            RefreshMessage::Start {
                operation_id,
                details: details.into(),
            },
            at,
        )
    }

    pub fn refreshing(operation_id: CorrelationId, count: u64, at: DateTime<Utc>) -> Self {
        Self::new(RefreshMessage::Refreshing { operation_id, count }, at)
    }

    /// Completion of a run that started at `started_at`.
    pub fn complete(
        operation_id: CorrelationId,
        count: u64,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let mut envelope = Self::new(RefreshMessage::Complete { operation_id, count }, started_at);
        envelope.finished_at = Some(finished_at);
        envelope
    }

    /// Failure of a run that started at `started_at`.
    pub fn error(
        operation_id: CorrelationId,
        exception_summary: impl Into<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let mut envelope = Self::new(
            RefreshMessage::Error {
                operation_id,
                exception_summary: exception_summary.into(),
            },
            started_at,
        );
        envelope.finished_at = Some(finished_at);
        envelope
    }

    /// Carry correlation and tracing headers over from the message that
    /// caused this one.
    pub fn caused_by(mut self, parent: &Envelope) -> Self {
        for (key, value) in &parent.headers {
            if key.starts_with("x-") || key == HEADER_CORRELATION_ID {
                continue;
            }
            self.headers.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self.headers.insert(
            HEADER_CAUSATION_ID.to_string(),
            JsonValue::String(parent.message_id.to_string()),
        );
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn header(&self, key: &str) -> Option<&JsonValue> {
        self.headers.get(key)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// `finished_at - created_at` for terminal messages.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|f| f - self.created_at)
    }

    pub fn message(&self) -> &RefreshMessage {
        &self.message
    }

    pub fn into_message(self) -> RefreshMessage {
        self.message
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    pub fn message_type(&self) -> &'static str {
        self.message.message_type()
    }

    pub fn operation_id(&self) -> &CorrelationId {
        self.message.operation_id()
    }

    /// Correlation id from the headers, falling back to the operation id.
    pub fn correlation_id(&self) -> CorrelationId {
        self.headers
            .get(HEADER_CORRELATION_ID)
            .and_then(JsonValue::as_str)
            .and_then(|s| CorrelationId::parse(s).ok())
            .unwrap_or_else(|| self.message.operation_id().clone())
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
