//! Telemetry module for logging and counters.
//!
//! Provides:
//! - Logging configuration and initialization
//! - Counters for executed commands and handled events

mod logging;
mod metrics;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use metrics::{Counter, Metrics};
