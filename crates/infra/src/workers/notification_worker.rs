use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use refsync_core::Subject;
use refsync_events::{Delivery, Envelope, HandlerOutcome, MessageHandler, RefreshMessage};

#[derive(Debug, thiserror::Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Outbound channel for human-readable run summaries.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, line: &str) -> Result<(), NotifyError>;
}

/// Writes summaries to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, line: &str) -> Result<(), NotifyError> {
        info!(target: "refsync::notification", "{line}");
        Ok(())
    }
}

fn seconds(envelope: &Envelope) -> f64 {
    envelope
        .duration()
        .map_or(0.0, |d| d.num_milliseconds() as f64 / 1000.0)
}

/// One-line summary of a start/complete/error event.
pub fn render(subject: &Subject, envelope: &Envelope) -> Option<String> {
    let line = match envelope.message() {
        RefreshMessage::Start {
            operation_id,
            details,
        } if details.is_empty() => format!("[{subject}] refresh {operation_id} started"),
        RefreshMessage::Start {
            operation_id,
            details,
        } => format!("[{subject}] refresh {operation_id} started: {details}"),
        RefreshMessage::Complete {
            operation_id,
            count,
        } => format!(
            "[{subject}] refresh {operation_id} completed: {count} records in {:.1}s",
            seconds(envelope)
        ),
        RefreshMessage::Error {
            operation_id,
            exception_summary,
        } => format!(
            "[{subject}] refresh {operation_id} failed after {:.1}s: {exception_summary}",
            seconds(envelope)
        ),
        RefreshMessage::Refresh { .. } | RefreshMessage::Refreshing { .. } => return None,
    };
    Some(line)
}

/// Consumer of `{subject}.start|complete|error` on the notification exchange.
pub struct NotificationWorker {
    subject: Subject,
    notifier: Arc<dyn Notifier>,
}

impl NotificationWorker {
    pub fn new(subject: Subject, notifier: Arc<dyn Notifier>) -> Self {
        Self { subject, notifier }
    }
}

impl core::fmt::Debug for NotificationWorker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NotificationWorker")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MessageHandler for NotificationWorker {
    async fn handle(&self, delivery: &Delivery, _cancel: &CancellationToken) -> HandlerOutcome {
        let Some(line) = render(&self.subject, &delivery.envelope) else {
            debug!(message_type = delivery.envelope.message_type(), "nothing to notify");
            return HandlerOutcome::Ack;
        };

        match self.notifier.notify(&line).await {
            Ok(()) => HandlerOutcome::Ack,
            Err(e) => {
                warn!(error = %e, "notifier failed");
                HandlerOutcome::retry(e.to_string())
            }
        }
    }
}
