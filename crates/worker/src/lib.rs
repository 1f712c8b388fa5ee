//! Refresh worker process: wiring and lifecycle.

pub mod app;

pub use app::{App, RunningApp};
