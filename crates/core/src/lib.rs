//! Shared building blocks for the refresh pipeline.
//!
//! Identifiers, the logical subject a refresh runs for, the clock abstraction
//! and the domain error model. No infrastructure concerns live here.

pub mod clock;
pub mod error;
pub mod id;
pub mod subject;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::DomainError;
pub use id::{CorrelationId, MessageId};
pub use subject::Subject;
