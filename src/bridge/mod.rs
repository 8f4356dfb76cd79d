//! Bridge membership lookups
//!
//! Hardware addresses of the member interfaces come from sysfs; which member
//! a given MAC sits behind comes from the bridge's forwarding database.

mod identity;
mod port_resolver;

pub use identity::{list_interfaces, InterfaceIdentityCache};
pub use port_resolver::{parse_showmacs, parse_showstp, BridgePortResolver};
