//! WireGuard configuration file parser
//!
//! Parses `.conf` files with [Interface] and [Peer] sections into a
//! [`DeviceConfig`], which converts into a [`ConfigUpdate`] that replaces
//! the device's whole configuration.

use std::net::SocketAddr;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::IpNet;

use super::uapi::{AllowedIpChange, ConfigUpdate, PeerUpdate};
use crate::error::ConfigError;

/// Complete device configuration
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Our private key (32 bytes)
    pub private_key: [u8; 32],
    /// Listen port (optional, for servers)
    pub listen_port: Option<u16>,
    /// Firewall mark for outgoing packets (optional)
    pub fwmark: Option<u32>,
    pub peers: Vec<PeerConfig>,
}

/// Peer configuration
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Peer's public key (32 bytes)
    pub public_key: [u8; 32],
    /// Pre-shared key (optional, 32 bytes)
    pub preshared_key: Option<[u8; 32]>,
    /// Peer's endpoint (IP:port)
    pub endpoint: Option<SocketAddr>,
    /// Allowed IP ranges for this peer
    pub allowed_ips: Vec<IpNet>,
    /// Keepalive interval in seconds (optional)
    pub persistent_keepalive: Option<u16>,
}

impl DeviceConfig {
    /// Parse a configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse a configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut interface: Option<InterfaceBuilder> = None;
        let mut peers: Vec<PeerBuilder> = Vec::new();
        let mut in_peer = None;

        for (index, raw) in content.lines().enumerate() {
            let line_num = index + 1;
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                match header.trim().to_ascii_lowercase().as_str() {
                    "interface" => {
                        interface.get_or_insert_with(InterfaceBuilder::default);
                        in_peer = Some(false);
                    }
                    "peer" => {
                        peers.push(PeerBuilder::default());
                        in_peer = Some(true);
                    }
                    other => {
                        return Err(ConfigError::ParseError {
                            line: line_num,
                            message: format!("Unknown section: [{}]", other),
                        })
                    }
                }
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim()))
                .ok_or_else(|| ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                })?;

            match (in_peer, interface.as_mut(), peers.last_mut()) {
                (Some(true), _, Some(peer)) => peer.set(&key, value, line_num)?,
                (Some(false), Some(iface), _) => iface.set(&key, value, line_num)?,
                _ => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: format!("'{}' appears before any section", key),
                    })
                }
            }
        }

        let interface = interface.ok_or(ConfigError::MissingField {
            field: "[Interface] section".to_string(),
        })?;
        let private_key = interface.private_key.ok_or(ConfigError::MissingField {
            field: "PrivateKey".to_string(),
        })?;

        Ok(DeviceConfig {
            private_key,
            listen_port: interface.listen_port,
            fwmark: interface.fwmark,
            peers: peers
                .into_iter()
                .map(PeerBuilder::build)
                .collect::<Result<_, _>>()?,
        })
    }

    /// Get our public key derived from the private key
    pub fn public_key(&self) -> [u8; 32] {
        crate::crypto::x25519::public_key(&self.private_key)
    }

    /// Update that makes a device match this file exactly
    pub fn to_update(&self) -> ConfigUpdate {
        ConfigUpdate {
            private_key: Some(Some(self.private_key)),
            listen_port: self.listen_port,
            fwmark: self.fwmark,
            replace_peers: true,
            peers: self
                .peers
                .iter()
                .map(|peer| PeerUpdate {
                    preshared_key: peer.preshared_key,
                    endpoint: peer.endpoint,
                    persistent_keepalive_interval: peer.persistent_keepalive,
                    replace_allowed_ips: true,
                    allowed_ips: peer
                        .allowed_ips
                        .iter()
                        .copied()
                        .map(AllowedIpChange::Add)
                        .collect(),
                    ..PeerUpdate::new(peer.public_key)
                })
                .collect(),
        }
    }
}

#[derive(Default)]
struct InterfaceBuilder {
    private_key: Option<[u8; 32]>,
    listen_port: Option<u16>,
    fwmark: Option<u32>,
}

impl InterfaceBuilder {
    fn set(&mut self, key: &str, value: &str, line: usize) -> Result<(), ConfigError> {
        match key {
            "privatekey" => self.private_key = Some(parse_key(value, "PrivateKey")?),
            "listenport" => self.listen_port = Some(parse_number(value, "ListenPort", line)?),
            "fwmark" if value.eq_ignore_ascii_case("off") => self.fwmark = Some(0),
            "fwmark" => self.fwmark = Some(parse_number(value, "FwMark", line)?),
            // wg-quick keys (Address, DNS, MTU, ...) belong to the host setup
            _ => tracing::debug!("Ignoring interface key: {}", key),
        }
        Ok(())
    }
}

/// Fields of one `[Peer]` section as they are read
#[derive(Default)]
struct PeerBuilder {
    public_key: Option<[u8; 32]>,
    preshared_key: Option<[u8; 32]>,
    endpoint: Option<SocketAddr>,
    allowed_ips: Vec<IpNet>,
    persistent_keepalive: Option<u16>,
}

impl PeerBuilder {
    fn set(&mut self, key: &str, value: &str, line: usize) -> Result<(), ConfigError> {
        match key {
            "publickey" => self.public_key = Some(parse_key(value, "PublicKey")?),
            "presharedkey" => self.preshared_key = Some(parse_key(value, "PresharedKey")?),
            "endpoint" => self.endpoint = Some(parse_endpoint(value)?),
            "allowedips" => {
                let nets = value
                    .split(',')
                    .map(str::trim)
                    .filter(|cidr| !cidr.is_empty())
                    .map(|cidr| {
                        cidr.parse::<IpNet>()
                            .map(|net| net.trunc())
                            .map_err(|_| ConfigError::InvalidCidr {
                                value: cidr.to_string(),
                            })
                    });
                for net in nets {
                    self.allowed_ips.push(net?);
                }
            }
            "persistentkeepalive" if value.eq_ignore_ascii_case("off") => {
                self.persistent_keepalive = None
            }
            "persistentkeepalive" => {
                self.persistent_keepalive = Some(parse_number(value, "PersistentKeepalive", line)?)
            }
            _ => tracing::debug!("Ignoring peer key: {}", key),
        }
        Ok(())
    }

    fn build(self) -> Result<PeerConfig, ConfigError> {
        let Some(public_key) = self.public_key else {
            return Err(ConfigError::MissingField {
                field: "PublicKey in [Peer]".to_string(),
            });
        };
        Ok(PeerConfig {
            public_key,
            preshared_key: self.preshared_key,
            endpoint: self.endpoint,
            allowed_ips: self.allowed_ips,
            persistent_keepalive: self.persistent_keepalive,
        })
    }
}

/// Decode a base64 key as written in `.conf` files
pub fn parse_key(value: &str, field: &str) -> Result<[u8; 32], ConfigError> {
    let invalid = || ConfigError::InvalidKey {
        field: field.to_string(),
    };
    BASE64
        .decode(value)
        .map_err(|_| invalid())?
        .try_into()
        .map_err(|_| invalid())
}

fn parse_number<T: std::str::FromStr>(value: &str, field: &str, line: usize) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::ParseError {
        line,
        message: format!("Invalid {}: {}", field, value),
    })
}

/// Parse an endpoint; only literal IP addresses are accepted
fn parse_endpoint(value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidAddress {
        value: value.to_string(),
    })
}
