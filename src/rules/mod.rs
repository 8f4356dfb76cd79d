//! Declarative network-configuration intents
//!
//! Reactions and lifecycle steps describe what they want as an [`Intent`];
//! the executor renders it to an argument vector and records the outcome in
//! the [`RuleLedger`].

mod intent;
mod ledger;

pub use intent::{Intent, Layer, Protocol, RouteDest, Verdict};
pub use ledger::{LedgerEntry, Outcome, RuleLedger};
