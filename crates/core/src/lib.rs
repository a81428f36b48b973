#![warn(clippy::unwrap_used)]

//! Shared building blocks for the drip sequence engine: the error type,
//! layered application configuration, and the engine event bus.

pub mod config;
pub mod error;
pub mod event_bus;
pub mod types;

pub use config::AppConfig;
pub use error::{DripError, DripResult};
