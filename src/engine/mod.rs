//! Topology-reactive spoofing
//!
//! Consumes already-classified topology facts and turns each into NAT, MAC
//! rewriting and routing rules that keep the bridge invisible to both the
//! switch and the supplicant.

mod events;
mod neighbors;
mod reactions;
mod topology;

pub use events::{BridgeUpdate, DiscoveryEvent};
pub use neighbors::{NeighborEntry, NeighborTable, Observation};
pub use reactions::{Handled, SpoofingEngine};
pub use topology::{Latch, Latches, Signal, TopologyState};
