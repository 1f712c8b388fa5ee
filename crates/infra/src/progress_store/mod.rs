//! Progress store backends.
//!
//! The in-memory store lives next to the trait in `refsync-refresh`; this
//! module holds the networked ones.

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "redis")]
pub use self::redis::RedisProgressStore;
