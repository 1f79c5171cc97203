//! Flat `key=value` control-plane grammar.
//!
//! Device keys come first; each `public_key=` line opens a peer section
//! that the following peer keys apply to. Keys are hex encoded. Input is
//! parsed completely into a [`ConfigUpdate`] before anything is applied.

use std::net::SocketAddr;

use ipnet::IpNet;

use crate::error::ConfigError;

/// Change to a peer's allowed IPs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowedIpChange {
    Add(IpNet),
    /// `allowed_ip=-<cidr>`: drop one prefix if the peer owns it
    Remove(IpNet),
}

/// A parsed `set` operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    /// `Some(None)` clears the key (an all-zero `private_key`)
    pub private_key: Option<Option<[u8; 32]>>,
    pub listen_port: Option<u16>,
    pub fwmark: Option<u32>,
    pub replace_peers: bool,
    pub peers: Vec<PeerUpdate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUpdate {
    pub public_key: [u8; 32],
    pub remove: bool,
    pub update_only: bool,
    pub preshared_key: Option<[u8; 32]>,
    pub endpoint: Option<SocketAddr>,
    pub persistent_keepalive_interval: Option<u16>,
    pub replace_allowed_ips: bool,
    pub allowed_ips: Vec<AllowedIpChange>,
}

impl PeerUpdate {
    pub fn new(public_key: [u8; 32]) -> Self {
        Self {
            public_key,
            remove: false,
            update_only: false,
            preshared_key: None,
            endpoint: None,
            persistent_keepalive_interval: None,
            replace_allowed_ips: false,
            allowed_ips: Vec::new(),
        }
    }

    fn set(&mut self, key: &str, value: &str, line: usize) -> Result<(), ConfigError> {
        match key {
            "remove" => self.remove = parse_true(value, line)?,
            "update_only" => self.update_only = parse_true(value, line)?,
            "preshared_key" => self.preshared_key = Some(parse_hex_key(value, key)?),
            "endpoint" => {
                let endpoint = value.parse().map_err(|_| ConfigError::InvalidAddress {
                    value: value.to_string(),
                })?;
                self.endpoint = Some(endpoint);
            }
            "persistent_keepalive_interval" => {
                self.persistent_keepalive_interval = Some(parse_number(key, value, line)?);
            }
            "replace_allowed_ips" => self.replace_allowed_ips = parse_true(value, line)?,
            "allowed_ip" => {
                let change = match value.strip_prefix('-') {
                    Some(cidr) => AllowedIpChange::Remove(parse_cidr(cidr)?),
                    None => AllowedIpChange::Add(parse_cidr(value)?),
                };
                self.allowed_ips.push(change);
            }
            "protocol_version" => {
                if value != "1" {
                    return Err(parse_error(line, format!("Invalid protocol version: {}", value)));
                }
            }
            _ => return Err(parse_error(line, format!("Invalid peer key: {}", key))),
        }
        Ok(())
    }
}

impl ConfigUpdate {
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let mut update = ConfigUpdate::default();

        for (index, line) in input.lines().enumerate() {
            let line_num = index + 1;
            if line.is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(parse_error(
                    line_num,
                    format!("Expected 'key=value', got: {}", line),
                ));
            };

            if key == "public_key" {
                update.peers.push(PeerUpdate::new(parse_hex_key(value, key)?));
                continue;
            }

            match update.peers.last_mut() {
                Some(peer) => peer.set(key, value, line_num)?,
                None => update.set(key, value, line_num)?,
            }
        }

        Ok(update)
    }

    fn set(&mut self, key: &str, value: &str, line: usize) -> Result<(), ConfigError> {
        match key {
            "private_key" => {
                let private_key = parse_hex_key(value, key)?;
                self.private_key = Some((private_key != [0u8; 32]).then_some(private_key));
            }
            "listen_port" => self.listen_port = Some(parse_number(key, value, line)?),
            "fwmark" => self.fwmark = Some(parse_number(key, value, line)?),
            "replace_peers" => self.replace_peers = parse_true(value, line)?,
            _ => return Err(parse_error(line, format!("Invalid device key: {}", key))),
        }
        Ok(())
    }
}

fn parse_error(line: usize, message: String) -> ConfigError {
    ConfigError::ParseError { line, message }
}

fn parse_true(value: &str, line: usize) -> Result<bool, ConfigError> {
    if value == "true" {
        Ok(true)
    } else {
        Err(parse_error(line, format!("Expected 'true', got: {}", value)))
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str, line: usize) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| parse_error(line, format!("Invalid {}: {}", key, value)))
}

fn parse_cidr(value: &str) -> Result<IpNet, ConfigError> {
    value
        .parse::<IpNet>()
        .map(|net| net.trunc())
        .map_err(|_| ConfigError::InvalidCidr {
            value: value.to_string(),
        })
}

/// Decode a 64-character hex key
pub fn parse_hex_key(value: &str, field: &str) -> Result<[u8; 32], ConfigError> {
    let mut key = [0u8; 32];
    hex::decode_to_slice(value, &mut key).map_err(|_| ConfigError::InvalidKey {
        field: field.to_string(),
    })?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER_A: &str = "58402e695ba1772b1cc9309755f043251ea77fdcf10fbe63989ceb7e19321376";
    const PEER_B: &str = "662e14fd594556f522604703340351258903b64f35553763f19426ab2a515c58";

    #[test]
    fn test_parse_device_and_peers() {
        let input = format!(
            "private_key=e84b5a6d2717c1003a13b431570353dbaca9146cf150c5f8575680feba52027a\n\
             listen_port=51820\n\
             fwmark=0\n\
             replace_peers=true\n\
             public_key={PEER_A}\n\
             preshared_key=188515093e952f5f22e865cef3012e72f8b5f0b598ac0309d5dacce3b70fcf52\n\
             endpoint=[abcd:23::33]:51820\n\
             persistent_keepalive_interval=25\n\
             replace_allowed_ips=true\n\
             allowed_ip=192.168.4.4/32\n\
             allowed_ip=10.0.0.1/24\n\
             public_key={PEER_B}\n\
             update_only=true\n\
             allowed_ip=-10.0.0.0/8\n\
             public_key={PEER_A}\n\
             remove=true\n"
        );

        let update = ConfigUpdate::parse(&input).unwrap();
        assert!(matches!(update.private_key, Some(Some(_))));
        assert_eq!(update.listen_port, Some(51820));
        assert_eq!(update.fwmark, Some(0));
        assert!(update.replace_peers);
        assert_eq!(update.peers.len(), 3);

        let a = &update.peers[0];
        assert_eq!(hex::encode(a.public_key), PEER_A);
        assert!(a.preshared_key.is_some());
        assert_eq!(a.endpoint.unwrap().port(), 51820);
        assert_eq!(a.persistent_keepalive_interval, Some(25));
        assert!(a.replace_allowed_ips);
        assert_eq!(
            a.allowed_ips,
            vec![
                AllowedIpChange::Add("192.168.4.4/32".parse().unwrap()),
                AllowedIpChange::Add("10.0.0.0/24".parse().unwrap()),
            ]
        );

        let b = &update.peers[1];
        assert!(b.update_only);
        assert_eq!(
            b.allowed_ips,
            vec![AllowedIpChange::Remove("10.0.0.0/8".parse().unwrap())]
        );

        assert!(update.peers[2].remove);
    }

    #[test]
    fn test_zero_private_key_clears() {
        let input = format!("private_key={}\n", "0".repeat(64));
        let update = ConfigUpdate::parse(&input).unwrap();
        assert_eq!(update.private_key, Some(None));
    }

    #[test]
    fn test_errors_report_line() {
        let input = format!("listen_port=51820\npublic_key={PEER_A}\nlisten_port=1\n");
        match ConfigUpdate::parse(&input) {
            Err(ConfigError::ParseError { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(ConfigUpdate::parse("listen_port=70000\n").is_err());
        assert!(ConfigUpdate::parse("replace_peers=false\n").is_err());
        assert!(ConfigUpdate::parse("private_key=abcd\n").is_err());
        assert!(ConfigUpdate::parse("bogus\n").is_err());

        let peer = |line: &str| format!("public_key={PEER_A}\n{line}\n");
        assert!(ConfigUpdate::parse(&peer("protocol_version=2")).is_err());
        assert!(ConfigUpdate::parse(&peer("allowed_ip=10.0.0.300/8")).is_err());
        assert!(ConfigUpdate::parse(&peer("endpoint=example.com:51820")).is_err());
        assert!(ConfigUpdate::parse(&peer("protocol_version=1")).is_ok());
    }
}
