//! Securities reference data.

pub mod security;

pub use security::{SECURITIES_BLOCK, Security};
