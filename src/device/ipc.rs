//! Applying control-plane updates and rendering the current configuration

use std::collections::HashSet;
use std::fmt::Write;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use super::Device;
use crate::config::uapi::{AllowedIpChange, ConfigUpdate, PeerUpdate};
use crate::error::ConfigError;
use crate::protocol::StaticIdentity;

impl Device {
    /// Parse and apply a `set` operation; on a parse error nothing changes
    pub async fn ipc_set(self: &Arc<Self>, input: &str) -> Result<(), ConfigError> {
        let update = ConfigUpdate::parse(input).map_err(|e| {
            tracing::warn!("Rejected configuration: {}", e);
            e
        })?;
        self.apply_config(update).await
    }

    pub async fn apply_config(self: &Arc<Self>, update: ConfigUpdate) -> Result<(), ConfigError> {
        if self.is_closed() {
            return Err(ConfigError::DeviceClosed);
        }
        self.check_peer_capacity(&update)?;

        if let Some(private_key) = update.private_key {
            self.set_private_key(private_key).await?;
        }
        {
            let mut net = self.net.lock();
            if let Some(port) = update.listen_port {
                net.listen_port = port;
            }
            if let Some(fwmark) = update.fwmark {
                net.fwmark = fwmark;
            }
        }
        if update.replace_peers {
            tracing::debug!("Removing all peers");
            self.remove_all_peers().await;
        }

        for peer in &update.peers {
            self.apply_peer(peer).await?;
        }
        Ok(())
    }

    /// Fail before touching anything if `update` would exceed the peer limit
    fn check_peer_capacity(&self, update: &ConfigUpdate) -> Result<(), ConfigError> {
        let own_key = match update.private_key {
            Some(private_key) => private_key.map(|key| *StaticIdentity::new(key).public_key()),
            None => self.public_key(),
        };
        let mut keys: HashSet<[u8; 32]> = if update.replace_peers {
            HashSet::new()
        } else {
            self.peers.read().keys().copied().collect()
        };
        if let Some(own_key) = &own_key {
            keys.remove(own_key);
        }

        // Peers are applied in order, so every intermediate count matters
        for peer in &update.peers {
            if peer.remove {
                keys.remove(&peer.public_key);
            } else if !peer.update_only && own_key != Some(peer.public_key) {
                keys.insert(peer.public_key);
            }
            if keys.len() > self.max_peers {
                return Err(ConfigError::TooManyPeers {
                    limit: self.max_peers,
                });
            }
        }
        Ok(())
    }

    async fn apply_peer(self: &Arc<Self>, update: &PeerUpdate) -> Result<(), ConfigError> {
        if update.remove {
            self.remove_peer(&update.public_key).await;
            return Ok(());
        }
        if self.public_key() == Some(update.public_key) {
            tracing::debug!("Ignoring peer with the device's own public key");
            return Ok(());
        }

        let peer = match self.lookup_peer(&update.public_key) {
            Some(peer) => peer,
            None if update.update_only => return Ok(()),
            None => self.new_peer(update.public_key)?,
        };

        if let Some(psk) = update.preshared_key {
            peer.set_preshared_key(psk);
        }
        if let Some(endpoint) = update.endpoint {
            peer.set_endpoint(endpoint);
        }

        let mut keepalive_turned_on = false;
        if let Some(interval) = update.persistent_keepalive_interval {
            keepalive_turned_on = peer.persistent_keepalive_interval() == 0 && interval > 0;
            peer.set_persistent_keepalive_interval(interval);
        }

        if update.replace_allowed_ips {
            self.allowed_ips.remove_by_peer(&peer);
        }
        for change in &update.allowed_ips {
            match *change {
                AllowedIpChange::Add(net) => self.allowed_ips.insert(net, Arc::clone(&peer)),
                AllowedIpChange::Remove(net) => self.allowed_ips.remove(net, &peer),
            }
        }

        if keepalive_turned_on && self.is_up() {
            peer.send_keepalive();
        }
        Ok(())
    }

    /// Render the configuration and counters in the `get` format
    pub fn ipc_get(&self) -> String {
        let mut out = String::new();

        if let Some(identity) = self.identity.read().as_ref() {
            let _ = writeln!(out, "private_key={}", hex::encode(identity.private_key()));
        }
        let net = *self.net.lock();
        if net.listen_port != 0 {
            let _ = writeln!(out, "listen_port={}", net.listen_port);
        }
        if net.fwmark != 0 {
            let _ = writeln!(out, "fwmark={}", net.fwmark);
        }

        let mut peers = self.peers();
        peers.sort_by_key(|peer| *peer.public_key());
        for peer in peers {
            let stats = peer.stats();
            let _ = writeln!(out, "public_key={}", hex::encode(peer.public_key()));
            let _ = writeln!(
                out,
                "preshared_key={}",
                hex::encode(peer.handshake.read().preshared_key())
            );
            let _ = writeln!(out, "protocol_version=1");
            if let Some(endpoint) = stats.endpoint {
                let _ = writeln!(out, "endpoint={}", endpoint);
            }

            let since_epoch = stats
                .last_handshake
                .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
                .unwrap_or_default();
            let _ = writeln!(out, "last_handshake_time_sec={}", since_epoch.as_secs());
            let _ = writeln!(out, "last_handshake_time_nsec={}", since_epoch.subsec_nanos());
            let _ = writeln!(out, "tx_bytes={}", stats.tx_bytes);
            let _ = writeln!(out, "rx_bytes={}", stats.rx_bytes);
            let _ = writeln!(
                out,
                "persistent_keepalive_interval={}",
                stats.persistent_keepalive_interval
            );
            for net in self.allowed_ips.entries_for_peer(&peer) {
                let _ = writeln!(out, "allowed_ip={}", net);
            }
        }

        out
    }
}
