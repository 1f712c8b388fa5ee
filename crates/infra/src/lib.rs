//! Infrastructure layer: configuration, broker and store clients, provider
//! and repository adapters, the job system and the refresh workers.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod config;
pub mod jobs;
pub mod progress_store;
pub mod repository;
pub mod source;
pub mod workers;
