use thiserror::Error;

/// Rejected value for one of the core types.
///
/// Only construction-time validation lives here; transport and storage
/// failures are owned by the crates that perform them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid subject '{value}': {reason}")]
    InvalidSubject { value: String, reason: &'static str },

    #[error("invalid {kind} '{value}': {reason}")]
    InvalidId {
        kind: &'static str,
        value: String,
        reason: String,
    },
}

impl DomainError {
    pub fn subject(value: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidSubject {
            value: value.into(),
            reason,
        }
    }

    pub fn id(kind: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidId {
            kind,
            value: value.into(),
            reason: reason.into(),
        }
    }
}
