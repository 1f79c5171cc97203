//! warpguard - WireGuard tunnelling core
//!
//! The protocol engine of a WireGuard endpoint, independent of any
//! particular socket or virtual interface.
//!
//! # Features
//!
//! - Noise IKpsk2 handshake with replay and flood protection
//! - Cookie MACs and per-source rate limiting under load
//! - Keypair rotation across previous/current/next slots
//! - Sliding-window replay filter
//! - Allowed-IPs routing trie for IPv4 and IPv6
//! - Per-peer retransmit, keepalive and rekey timers
//! - Parallel encryption with in-order delivery per peer
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use warpguard::device::{Device, DeviceOptions};
//! use warpguard::tunnel::channel::{ChannelInterface, ChannelTransport};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let (transport, _datagrams) = ChannelTransport::new("192.0.2.1:51820".parse()?);
//! let (interface, _packets) = ChannelInterface::new(1420);
//! let device = Device::new(Arc::new(transport), Arc::new(interface), DeviceOptions::default());
//!
//! let config = warpguard::DeviceConfig::from_file("wg0.conf")?;
//! device.apply_config(config.to_update()).await?;
//! device.up();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod tunnel;

pub use config::DeviceConfig;
pub use device::{Device, DeviceOptions, Peer};
pub use error::WireGuardError;
