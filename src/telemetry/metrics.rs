//! Orchestrator counters.
//!
//! Thread-safe counters for commands executed and discovery events handled.
//! They surface in the state snapshot; nothing scrapes them.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters shared by the executor and the orchestrator loop.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Invocations handed to a runner.
    pub commands_run: Counter,
    /// Invocations that failed and were surfaced to the caller.
    pub commands_failed: Counter,
    /// Invocations that hit the execution deadline.
    pub commands_timed_out: Counter,
    /// Failures swallowed because the invocation was marked optional.
    pub commands_absorbed: Counter,

    /// Discovery events that ran a reaction.
    pub events_handled: Counter,
    /// Redelivered one-shot events that were ignored.
    pub events_ignored: Counter,
    /// Feed lines that could not be parsed into an event.
    pub events_rejected: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exports all counters as key-value pairs.
    pub fn export(&self) -> Vec<(String, u64)> {
        vec![
            ("commands_run".into(), self.commands_run.get()),
            ("commands_failed".into(), self.commands_failed.get()),
            ("commands_timed_out".into(), self.commands_timed_out.get()),
            ("commands_absorbed".into(), self.commands_absorbed.get()),
            ("events_handled".into(), self.events_handled.get()),
            ("events_ignored".into(), self.events_ignored.get()),
            ("events_rejected".into(), self.events_rejected.get()),
        ]
    }
}
