//! Refresh run lifecycle.
//!
//! A run is identified by its correlation id and tracked in a
//! [`RefreshProgress`] record. [`RefreshStateMachine`] is the only writer of
//! those records; it enforces the transition rules and keeps at most one live
//! run per subject.

pub mod error;
pub mod progress;
pub mod state_machine;
pub mod store;

pub use error::{RefreshError, StoreError};
pub use progress::{Applied, RefreshProgress, RefreshStatus, Transition};
pub use state_machine::RefreshStateMachine;
pub use store::{InMemoryProgressStore, ProgressStore, active_key, progress_key};
