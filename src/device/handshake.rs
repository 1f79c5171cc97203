//! Handshake message creation and consumption at device level.
//!
//! These wrap the per-peer [`Handshake`](crate::protocol::Handshake) state
//! machine with the device-wide pieces it needs: our static identity, the
//! peer map and the receiver index table.

use std::sync::Arc;

use super::index_table::IndexTarget;
use super::peer::Peer;
use super::Device;
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::open_initiation;
use crate::protocol::{HandshakeInitiation, HandshakeResponse, StaticIdentity};

impl Device {
    fn identity(&self) -> Result<StaticIdentity> {
        self.identity
            .read()
            .clone()
            .ok_or_else(|| ProtocolError::UnexpectedState { state: "no private key" }.into())
    }

    /// Start a fresh handshake with `peer` under a newly allocated index
    pub fn create_message_initiation(&self, peer: &Arc<Peer>) -> Result<HandshakeInitiation> {
        let identity = self.identity()?;
        let mut handshake = peer.handshake.write();
        if let Some(old) = handshake.clear() {
            self.index_table.delete(old);
        }

        let index = self.index_table.new_index_for_handshake(peer)?;
        handshake.create_initiation(&identity, index).map_err(|e| {
            handshake.clear();
            self.index_table.delete(index);
            e
        })
    }

    /// Authenticate an initiation and hand it to the peer it claims to be from
    pub fn consume_message_initiation(&self, msg: &HandshakeInitiation) -> Result<Arc<Peer>> {
        let identity = self.identity()?;
        let opened = open_initiation(&identity, msg)?;
        let peer = self
            .lookup_peer(opened.remote_static())
            .ok_or(ProtocolError::UnknownPeer)?;
        peer.handshake.write().consume_initiation(opened)?;
        Ok(peer)
    }

    /// Answer a consumed initiation under a newly allocated index
    pub fn create_message_response(&self, peer: &Arc<Peer>) -> Result<HandshakeResponse> {
        let mut handshake = peer.handshake.write();
        let previous = handshake.local_index();

        let index = self.index_table.new_index_for_handshake(peer)?;
        match handshake.create_response(index) {
            Ok(msg) => {
                if let Some(previous) = previous {
                    self.index_table.delete(previous);
                }
                Ok(msg)
            }
            Err(e) => {
                self.index_table.delete(index);
                Err(e)
            }
        }
    }

    /// Complete our initiation with the responder's reply
    pub fn consume_message_response(&self, msg: &HandshakeResponse) -> Result<Arc<Peer>> {
        let (peer, target) = self
            .index_table
            .lookup(msg.receiver_index)
            .ok_or(ProtocolError::InvalidReceiverIndex {
                index: msg.receiver_index,
            })?;
        if !matches!(target, IndexTarget::Handshake) {
            return Err(ProtocolError::InvalidReceiverIndex {
                index: msg.receiver_index,
            }
            .into());
        }

        let identity = self.identity()?;
        peer.handshake.write().consume_response(&identity, msg)?;
        Ok(peer)
    }
}
