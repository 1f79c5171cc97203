//! Configuration for the device
//!
//! Two front ends produce the same [`ConfigUpdate`]: standard WireGuard
//! `.conf` files and the flat `key=value` control-plane grammar.

mod parser;
pub mod uapi;

pub use parser::{parse_key, DeviceConfig, PeerConfig};
pub use uapi::{AllowedIpChange, ConfigUpdate, PeerUpdate};
