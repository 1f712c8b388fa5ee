use refsync_core::CorrelationId;

use crate::progress::RefreshStatus;

/// Progress store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("progress store unavailable: {0}")]
    Unavailable(String),

    #[error("progress store timed out: {0}")]
    Timeout(String),

    #[error("progress record could not be (de)serialized: {0}")]
    Serialization(String),

    #[error("progress store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// I/O-class failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Serialization(value.to_string())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RefreshError {
    #[error("invalid refresh transition {from} -> {to}")]
    InvalidTransition {
        from: RefreshStatus,
        to: RefreshStatus,
    },

    #[error("refresh run not found: {0}")]
    NotFound(CorrelationId),

    #[error("another refresh run is in flight: {active}")]
    Busy { active: CorrelationId },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RefreshError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RefreshError::Store(e) if e.is_transient())
    }
}
