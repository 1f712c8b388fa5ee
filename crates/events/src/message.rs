use serde::{Deserialize, Serialize};

use refsync_core::CorrelationId;

/// Closed set of refresh contracts.
///
/// On the wire the variant is selected by the `message_type` discriminator
/// and its fields sit next to the envelope fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum RefreshMessage {
    /// Request to run a refresh (`{subject}.refresh`).
    Refresh { operation_id: CorrelationId },
    /// A run has started processing (`{subject}.start`).
    Start {
        operation_id: CorrelationId,
        #[serde(default)]
        details: String,
    },
    /// Running total of rows downloaded so far (`{subject}.refreshing`).
    Refreshing {
        operation_id: CorrelationId,
        count: u64,
    },
    /// A run finished; `count` rows were saved (`{subject}.complete`).
    Complete {
        operation_id: CorrelationId,
        count: u64,
    },
    /// A run failed (`{subject}.error`).
    Error {
        operation_id: CorrelationId,
        exception_summary: String,
    },
}

/// Discriminator of a [`RefreshMessage`], also the routing-key suffix.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Refresh,
    Start,
    Refreshing,
    Complete,
    Error,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::Refresh,
        MessageKind::Start,
        MessageKind::Refreshing,
        MessageKind::Complete,
        MessageKind::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Refresh => "refresh",
            MessageKind::Start => "start",
            MessageKind::Refreshing => "refreshing",
            MessageKind::Complete => "complete",
            MessageKind::Error => "error",
        }
    }

    /// Whether the message ends a run.
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageKind::Complete | MessageKind::Error)
    }
}

impl core::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RefreshMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            RefreshMessage::Refresh { .. } => MessageKind::Refresh,
            RefreshMessage::Start { .. } => MessageKind::Start,
            RefreshMessage::Refreshing { .. } => MessageKind::Refreshing,
            RefreshMessage::Complete { .. } => MessageKind::Complete,
            RefreshMessage::Error { .. } => MessageKind::Error,
        }
    }

    /// Stable wire discriminator (e.g. `"complete"`).
    pub fn message_type(&self) -> &'static str {
        self.kind().as_str()
    }

    /// The run this message belongs to.
    pub fn operation_id(&self) -> &CorrelationId {
        match self {
            RefreshMessage::Refresh { operation_id }
            | RefreshMessage::Start { operation_id, .. }
            | RefreshMessage::Refreshing { operation_id, .. }
            | RefreshMessage::Complete { operation_id, .. }
            | RefreshMessage::Error { operation_id, .. } => operation_id,
        }
    }
}
