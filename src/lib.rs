//! Dolos - 802.1x MitM bridge orchestrator
//!
//! Establishes a default-deny baseline on a transparent bridge, installs
//! NAT and MAC-rewriting rules as the client and gateway identities are
//! learned, and tears everything down on shutdown.

pub mod bridge;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod exec;
pub mod lifecycle;
pub mod net;
pub mod orchestrator;
pub mod rules;
pub mod telemetry;

pub use error::{Error, Result};
